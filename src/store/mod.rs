//! Mail store boundary
//!
//! The mail store is the single source of truth for accounts, folders and
//! messages and lives outside this crate. The agent only needs a handful of
//! read queries, local persistence of fetched attachment parts, and the
//! change notifications the store broadcasts.

use serde::{Deserialize, Serialize};

use crate::types::error::Result;
use crate::types::{AccountId, AttachmentLocation, FolderId, MessageId, StandardFolder};

/// Read access to the external mail store plus local attachment persistence.
///
/// Implementations are expected to be cheap to query; the agent calls these
/// from its coordinating task.
pub trait MailStore: Send + Sync {
    /// Accounts enabled for synchronization.
    fn enabled_accounts(&self) -> Vec<AccountId>;

    /// Resolve a well-known folder of an account.
    fn standard_folder(&self, account: AccountId, folder: StandardFolder) -> Option<FolderId>;

    /// Folders of an account that participate in a full sync.
    fn synchronizable_folders(&self, account: AccountId) -> Vec<FolderId>;

    /// Whether the account has messages waiting to be sent.
    fn has_messages_in_outbox(&self, account: AccountId) -> bool;

    /// Account owning a message, if the message exists.
    fn account_of_message(&self, message: MessageId) -> Option<AccountId>;

    /// Persist the fetched bytes of an attachment part locally.
    fn save_attachment(&self, location: &AttachmentLocation) -> Result<()>;
}

/// Change notification broadcast by the mail store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    AccountsAdded(Vec<AccountId>),
    AccountsRemoved(Vec<AccountId>),
    AccountsUpdated(Vec<AccountId>),
    MessagesAdded(Vec<MessageId>),
    MessagesRemoved(Vec<MessageId>),
    FoldersChanged(AccountId),
}
