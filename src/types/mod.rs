//! Shared identifier and status types
//!
//! Everything the agent reports to the outside world is expressed in these
//! types, so they are all serializable for consumption by a UI bridge.

pub mod error;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a mail account in the mail store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a folder in the mail store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(pub u64);

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message in the mail store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a queued action, unique and monotonically increasing
/// within one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location of an attachment: the message it belongs to plus the MIME part
/// path within that message (e.g. "2.1.3").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentLocation {
    pub message: MessageId,
    pub part: String,
}

impl AttachmentLocation {
    pub fn new(message: MessageId, part: impl Into<String>) -> Self {
        Self {
            message,
            part: part.into(),
        }
    }
}

impl fmt::Display for AttachmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.message, self.part)
    }
}

/// Well-known per-account folders resolved through the mail store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardFolder {
    Inbox,
    Outbox,
    Drafts,
    Sent,
    Trash,
    Junk,
}

/// Terminal status broadcast for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synchronizing,
    Completed,
    Error,
}

/// Lifecycle of a tracked attachment download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentStatus {
    NotDownloaded,
    Queued,
    Downloading,
    Downloaded,
    Failed,
    /// The bytes were fetched from the server but could not be persisted
    /// locally. Distinct from `Failed`.
    FailedToSave,
}

/// Client-facing error taxonomy for backend failures.
///
/// Cancellation is a terminal state, not an error, and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    /// Transient network failure, retryable by re-issuing the request.
    SyncFailed,
    /// Authentication against the mail server failed.
    LoginFailed,
    /// Local storage is exhausted. Fatal to a running sync.
    DiskFull,
}

/// Bit masks for [`FlagMessages`](crate::sync::action::ActionKind::FlagMessages)
/// set/unset operations.
pub mod message_flags {
    pub const READ: u64 = 1 << 0;
    pub const IMPORTANT: u64 = 1 << 1;
    pub const REPLIED: u64 = 1 << 2;
    pub const FORWARDED: u64 = 1 << 3;
    pub const TRASH: u64 = 1 << 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_location_display() {
        let location = AttachmentLocation::new(MessageId(42), "2.1.3");
        assert_eq!(location.to_string(), "42/2.1.3");
    }

    #[test]
    fn test_ids_are_transparent_in_json() {
        let json = serde_json::to_string(&AccountId(7)).unwrap();
        assert_eq!(json, "7");
        let back: AccountId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AccountId(7));
    }
}
