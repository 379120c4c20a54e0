//! Queued mail operations
//!
//! Every request the agent accepts is described by an immutable [`Action`]:
//! a unique id plus a tagged [`ActionKind`]. The kind decides which backend
//! lane executes the operation and which other actions it is equivalent to
//! for dedup purposes.

use serde::{Deserialize, Serialize};

use crate::types::{AccountId, ActionId, AttachmentLocation, FolderId, MessageId};

/// Backend execution lane. The backend exposes one single-slot executor per
/// lane; lanes are serialized internally but proceed in parallel with each
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    Retrieval,
    Storage,
    Transmit,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Retrieval, Lane::Storage, Lane::Transmit];

    /// Lanes that talk to the network and are suspended while offline.
    /// Storage mutations are local and keep running.
    pub const NETWORK: [Lane; 2] = [Lane::Retrieval, Lane::Transmit];
}

/// Types of operations that can be queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionKind {
    /// Refresh the folder hierarchy of an account. `folder` restricts the
    /// listing to a subtree, `None` lists from the account root.
    RetrieveFolderList {
        account: AccountId,
        folder: Option<FolderId>,
        descending: bool,
    },

    /// Refresh the message listing of a folder, fetching at least `minimum`
    /// message headers.
    RetrieveMessageList {
        account: AccountId,
        folder: FolderId,
        minimum: u32,
    },

    /// Fetch the full content of the given messages.
    RetrieveMessages { ids: Vec<MessageId> },

    /// Fetch a single MIME part (attachment download).
    RetrieveMessagePart { location: AttachmentLocation },

    /// Extend a partially fetched message by at least `minimum` bytes.
    RetrieveMessageRange { message: MessageId, minimum: u32 },

    /// Transmit everything waiting in the account's outbox.
    Send { account: AccountId },

    /// Push locally recorded changes (flags, deletions) to the server.
    ExportUpdates { account: AccountId },

    /// Move messages to another folder.
    MoveMessages {
        ids: Vec<MessageId>,
        destination: FolderId,
    },

    /// Delete messages.
    DeleteMessages { ids: Vec<MessageId> },

    /// Apply flag masks to messages (set then unset).
    FlagMessages {
        ids: Vec<MessageId>,
        set_mask: u64,
        unset_mask: u64,
    },

    /// Create a folder under `parent`, or at the account root for `None`.
    CreateFolder {
        account: AccountId,
        name: String,
        parent: Option<FolderId>,
    },

    /// Rename a folder.
    RenameFolder { folder: FolderId, name: String },

    /// Delete a folder.
    DeleteFolder { folder: FolderId },

    /// Run a server-side search.
    Search {
        account: AccountId,
        query: String,
        limit: u32,
    },

    /// Drop everything waiting in the account's sending queue.
    PurgeSendingQueue { account: AccountId },
}

impl ActionKind {
    /// Get the action kind string for logging
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::RetrieveFolderList { .. } => "retrieve_folder_list",
            Self::RetrieveMessageList { .. } => "retrieve_message_list",
            Self::RetrieveMessages { .. } => "retrieve_messages",
            Self::RetrieveMessagePart { .. } => "retrieve_message_part",
            Self::RetrieveMessageRange { .. } => "retrieve_message_range",
            Self::Send { .. } => "send",
            Self::ExportUpdates { .. } => "export_updates",
            Self::MoveMessages { .. } => "move_messages",
            Self::DeleteMessages { .. } => "delete_messages",
            Self::FlagMessages { .. } => "flag_messages",
            Self::CreateFolder { .. } => "create_folder",
            Self::RenameFolder { .. } => "rename_folder",
            Self::DeleteFolder { .. } => "delete_folder",
            Self::Search { .. } => "search",
            Self::PurgeSendingQueue { .. } => "purge_sending_queue",
        }
    }

    /// The backend lane this operation executes on.
    pub fn lane(&self) -> Lane {
        match self {
            Self::RetrieveFolderList { .. }
            | Self::RetrieveMessageList { .. }
            | Self::RetrieveMessages { .. }
            | Self::RetrieveMessagePart { .. }
            | Self::RetrieveMessageRange { .. }
            | Self::ExportUpdates { .. }
            | Self::Search { .. } => Lane::Retrieval,
            Self::MoveMessages { .. }
            | Self::DeleteMessages { .. }
            | Self::FlagMessages { .. }
            | Self::CreateFolder { .. }
            | Self::RenameFolder { .. }
            | Self::DeleteFolder { .. } => Lane::Storage,
            Self::Send { .. } | Self::PurgeSendingQueue { .. } => Lane::Transmit,
        }
    }

    /// Get the account this action operates on, where one is named directly.
    pub fn account(&self) -> Option<AccountId> {
        match self {
            Self::RetrieveFolderList { account, .. }
            | Self::RetrieveMessageList { account, .. }
            | Self::Send { account }
            | Self::ExportUpdates { account }
            | Self::CreateFolder { account, .. }
            | Self::Search { account, .. }
            | Self::PurgeSendingQueue { account } => Some(*account),
            _ => None,
        }
    }

    /// Get the message ids this action operates on
    pub fn message_ids(&self) -> Option<&[MessageId]> {
        match self {
            Self::RetrieveMessages { ids }
            | Self::MoveMessages { ids, .. }
            | Self::DeleteMessages { ids }
            | Self::FlagMessages { ids, .. } => Some(ids),
            _ => None,
        }
    }

    /// Dedup identity: same kind, same account, same folder/message target
    /// set. Scalar knobs like `minimum` and `descending` do not participate,
    /// so re-requesting a listing with a different floor still dedups against
    /// the queued one.
    pub fn equivalent(&self, other: &ActionKind) -> bool {
        match (self, other) {
            (
                Self::RetrieveFolderList {
                    account: a1,
                    folder: f1,
                    ..
                },
                Self::RetrieveFolderList {
                    account: a2,
                    folder: f2,
                    ..
                },
            ) => a1 == a2 && f1 == f2,
            (
                Self::RetrieveMessageList {
                    account: a1,
                    folder: f1,
                    ..
                },
                Self::RetrieveMessageList {
                    account: a2,
                    folder: f2,
                    ..
                },
            ) => a1 == a2 && f1 == f2,
            (Self::RetrieveMessages { ids: i1 }, Self::RetrieveMessages { ids: i2 }) => i1 == i2,
            (
                Self::RetrieveMessagePart { location: l1 },
                Self::RetrieveMessagePart { location: l2 },
            ) => l1 == l2,
            (
                Self::RetrieveMessageRange { message: m1, .. },
                Self::RetrieveMessageRange { message: m2, .. },
            ) => m1 == m2,
            (Self::Send { account: a1 }, Self::Send { account: a2 }) => a1 == a2,
            (Self::ExportUpdates { account: a1 }, Self::ExportUpdates { account: a2 }) => a1 == a2,
            (
                Self::MoveMessages {
                    ids: i1,
                    destination: d1,
                },
                Self::MoveMessages {
                    ids: i2,
                    destination: d2,
                },
            ) => i1 == i2 && d1 == d2,
            (Self::DeleteMessages { ids: i1 }, Self::DeleteMessages { ids: i2 }) => i1 == i2,
            // Flag masks participate in the identity: marking the same set
            // read and then unread are two distinct operations.
            (
                Self::FlagMessages {
                    ids: i1,
                    set_mask: s1,
                    unset_mask: u1,
                },
                Self::FlagMessages {
                    ids: i2,
                    set_mask: s2,
                    unset_mask: u2,
                },
            ) => i1 == i2 && s1 == s2 && u1 == u2,
            (
                Self::CreateFolder {
                    account: a1,
                    name: n1,
                    parent: p1,
                },
                Self::CreateFolder {
                    account: a2,
                    name: n2,
                    parent: p2,
                },
            ) => a1 == a2 && n1 == n2 && p1 == p2,
            (
                Self::RenameFolder {
                    folder: f1,
                    name: n1,
                },
                Self::RenameFolder {
                    folder: f2,
                    name: n2,
                },
            ) => f1 == f2 && n1 == n2,
            (Self::DeleteFolder { folder: f1 }, Self::DeleteFolder { folder: f2 }) => f1 == f2,
            (
                Self::Search {
                    account: a1,
                    query: q1,
                    ..
                },
                Self::Search {
                    account: a2,
                    query: q2,
                    ..
                },
            ) => a1 == a2 && q1 == q2,
            (
                Self::PurgeSendingQueue { account: a1 },
                Self::PurgeSendingQueue { account: a2 },
            ) => a1 == a2,
            _ => false,
        }
    }
}

/// An immutable description of one requested mail operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    id: ActionId,
    kind: ActionKind,
}

impl Action {
    pub fn new(id: ActionId, kind: ActionKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn lane(&self) -> Lane {
        self.kind.lane()
    }

    /// True for actions that cannot run while offline.
    pub fn needs_network(&self) -> bool {
        self.lane() != Lane::Storage
    }

    pub fn equivalent(&self, other: &Action) -> bool {
        self.kind.equivalent(&other.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_serialization() {
        let kind = ActionKind::MoveMessages {
            ids: vec![MessageId(1), MessageId(2)],
            destination: FolderId(9),
        };

        let json = serde_json::to_string(&kind).unwrap();
        let deserialized: ActionKind = serde_json::from_str(&json).unwrap();

        match deserialized {
            ActionKind::MoveMessages { ids, destination } => {
                assert_eq!(ids, vec![MessageId(1), MessageId(2)]);
                assert_eq!(destination, FolderId(9));
            }
            _ => panic!("Wrong action kind"),
        }
    }

    #[test]
    fn test_lane_assignment() {
        let retrieval = ActionKind::RetrieveMessageList {
            account: AccountId(1),
            folder: FolderId(2),
            minimum: 20,
        };
        let storage = ActionKind::DeleteMessages {
            ids: vec![MessageId(3)],
        };
        let transmit = ActionKind::Send {
            account: AccountId(1),
        };

        assert_eq!(retrieval.lane(), Lane::Retrieval);
        assert_eq!(storage.lane(), Lane::Storage);
        assert_eq!(transmit.lane(), Lane::Transmit);
    }

    #[test]
    fn test_equivalence_ignores_scalar_knobs() {
        let a = ActionKind::RetrieveMessageList {
            account: AccountId(1),
            folder: FolderId(2),
            minimum: 20,
        };
        let b = ActionKind::RetrieveMessageList {
            account: AccountId(1),
            folder: FolderId(2),
            minimum: 200,
        };
        let c = ActionKind::RetrieveMessageList {
            account: AccountId(1),
            folder: FolderId(3),
            minimum: 20,
        };

        assert!(a.equivalent(&b));
        assert!(!a.equivalent(&c));
        assert_ne!(a, b);
    }

    #[test]
    fn test_flag_masks_participate_in_identity() {
        use crate::types::message_flags::READ;

        let mark_read = ActionKind::FlagMessages {
            ids: vec![MessageId(1)],
            set_mask: READ,
            unset_mask: 0,
        };
        let mark_unread = ActionKind::FlagMessages {
            ids: vec![MessageId(1)],
            set_mask: 0,
            unset_mask: READ,
        };

        assert!(!mark_read.equivalent(&mark_unread));
    }

    #[test]
    fn test_storage_actions_run_offline() {
        let action = Action::new(
            ActionId(1),
            ActionKind::FlagMessages {
                ids: vec![MessageId(1)],
                set_mask: crate::types::message_flags::READ,
                unset_mask: 0,
            },
        );
        assert!(!action.needs_network());

        let action = Action::new(
            ActionId(2),
            ActionKind::Send {
                account: AccountId(1),
            },
        );
        assert!(action.needs_network());
    }
}
