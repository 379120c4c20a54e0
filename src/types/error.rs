//! Unified error type for the agent
//!
//! All errors are serializable so they can be forwarded to a UI layer.
//! Error messages should be user-friendly and actionable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AccountId, FolderId, MessageId};

/// Agent error type for request handling and configuration.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Folder not found: {0}")]
    FolderNotFound(FolderId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Mail store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network is offline")]
    Offline,

    #[error("Agent task is no longer running")]
    Stopped,
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        AgentError::Config(err.to_string())
    }
}

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;
