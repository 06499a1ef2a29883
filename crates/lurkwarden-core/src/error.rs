//! Errors surfaced by moderation operations and commands.

use crate::gateway::GatewayError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors returned by the moderation engine
#[derive(Error, Debug)]
pub enum ModerationError {
    /// Another purge holds the process-wide purge lock
    #[error("a purge is already running")]
    PurgeInProgress,
    /// The chat has no configuration and is not tracked
    #[error("chat {0} is not tracked")]
    ChatNotTracked(i64),
    /// The chat was untracked because the bot lost access to it
    #[error("chat {0} became inaccessible and was untracked")]
    ChatUntracked(i64),
    /// Cutoff text could not be parsed
    #[error("invalid cutoff {0:?}, expected e.g. 30m, 12h, 3d, 2w, 1M, 1y")]
    InvalidCutoff(String),
    /// A command argument was rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Platform query or action failed
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    /// Persistence failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ModerationError {
    /// Whether the failure means the bot lost access to the chat.
    #[must_use]
    pub const fn is_chat_loss(&self) -> bool {
        match self {
            Self::ChatUntracked(_) => true,
            Self::Gateway(err) => err.is_chat_loss(),
            _ => false,
        }
    }
}
