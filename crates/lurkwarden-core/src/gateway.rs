//! Platform query interface.
//!
//! [`ChatGateway`] is the seam between the engine and a chat platform. Every
//! call may fail with [`GatewayError::RateLimited`], which callers retry through
//! [`crate::retry::RetryPolicy`].

use crate::model::{ParticipantKind, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by platform calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Flood control; retry after `wait`
    #[error("rate limited, retry after {wait:?}")]
    RateLimited {
        /// Server-mandated wait.
        wait: Duration,
    },
    /// The bot lacks rights in the chat or was removed from it
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The chat does not exist or is not visible to the bot
    #[error("chat not found: {0}")]
    NotFound(String),
    /// The user is unknown to the platform or to the chat
    #[error("member not found: {0}")]
    MemberNotFound(String),
    /// Network hiccup worth a short retry
    #[error("transient error: {0}")]
    Transient(String),
    /// Anything else
    #[error("unexpected gateway error: {0}")]
    Unexpected(String),
}

impl GatewayError {
    /// Chat-level access loss; the chat should be untracked.
    #[must_use]
    pub const fn is_chat_loss(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::NotFound(_))
    }

    /// Worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// A participant as seen by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Account profile.
    pub profile: UserProfile,
    /// Participant kind.
    pub kind: ParticipantKind,
    /// Join date, when the platform reports one.
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Shorthand for the account id.
    #[must_use]
    pub const fn user_id(&self) -> i64 {
        self.profile.user_id
    }
}

/// Kind of chat, which decides how a kick is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// Small basic group.
    Group,
    /// Supergroup.
    Supergroup,
    /// Broadcast channel.
    Channel,
    /// One-to-one chat.
    Private,
}

impl ChatKind {
    /// Whether a ban can be lifted so the removed user may rejoin.
    #[must_use]
    pub const fn allows_rejoin_after_kick(self) -> bool {
        matches!(self, Self::Supergroup | Self::Channel)
    }
}

/// Basic chat information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    /// Chat id.
    pub chat_id: i64,
    /// Title if the platform returned one.
    pub title: Option<String>,
    /// Chat kind.
    pub kind: ChatKind,
}

/// Query interface of a chat platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Enumerate current participants. May be incomplete. Departed users
    /// (`Left`, `Banned`) may be included; their kind is taken as authoritative.
    async fn list_participants(&self, chat_id: i64) -> Result<Vec<Participant>, GatewayError>;
    /// Whether [`ChatGateway::list_banned`] is available for this chat.
    fn supports_ban_list(&self, chat_id: i64) -> bool;
    /// Enumerate banned user ids.
    async fn list_banned(&self, chat_id: i64) -> Result<Vec<i64>, GatewayError>;
    /// Admin and owner ids.
    async fn get_administrators(&self, chat_id: i64) -> Result<Vec<i64>, GatewayError>;
    /// Authoritative single-user lookup.
    async fn get_member(&self, chat_id: i64, user_id: i64) -> Result<Participant, GatewayError>;
    /// Chat information; fails with a chat-loss error when the bot lost access.
    async fn chat_info(&self, chat_id: i64) -> Result<ChatInfo, GatewayError>;
    /// Kind of the chat.
    fn chat_kind(&self, chat_id: i64) -> ChatKind;
    /// Remove the user while allowing them to rejoin (ban followed by unban).
    async fn kick(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError>;
    /// Ban the user.
    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError>;
    /// Lift a ban.
    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError>;
    /// Send a plain notice.
    async fn send_message(&self, chat_id: i64, text: String) -> Result<(), GatewayError>;
}
