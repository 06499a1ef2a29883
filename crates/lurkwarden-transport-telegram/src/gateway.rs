//! [`ChatGateway`] over the Telegram Bot API.
//!
//! The Bot API cannot enumerate chat members. [`TelegramGateway::list_participants`]
//! therefore probes the stored roster plus the administrator list with point
//! lookups; users the bot has never seen only enter the roster through member
//! events and messages.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lurkwarden_core::gateway::{ChatGateway, ChatInfo, ChatKind, GatewayError, Participant};
use lurkwarden_core::model::{ParticipantKind, StatusFilter, UserProfile};
use lurkwarden_core::storage::MembershipStore;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatMember, ChatMemberKind, User};
use teloxide::RequestError;
use tracing::debug;

/// Supergroup and channel ids carry the `-100` prefix.
const SUPERGROUP_ID_THRESHOLD: i64 = -1_000_000_000_000;

/// Telegram-backed gateway.
pub struct TelegramGateway {
    bot: Bot,
    store: Arc<dyn MembershipStore>,
    probe_concurrency: usize,
}

impl TelegramGateway {
    /// Create the gateway. `store` supplies the roster probed during sweeps.
    #[must_use]
    pub fn new(bot: Bot, store: Arc<dyn MembershipStore>, probe_concurrency: usize) -> Self {
        Self {
            bot,
            store,
            probe_concurrency: probe_concurrency.max(1),
        }
    }
}

/// Telegram user id as stored by the engine.
#[must_use]
pub const fn user_id_of(user: &User) -> i64 {
    user.id.0.cast_signed()
}

const fn telegram_user(user_id: i64) -> UserId {
    UserId(user_id.cast_unsigned())
}

/// Engine profile of a Telegram user.
#[must_use]
pub fn profile_of(user: &User) -> UserProfile {
    UserProfile {
        user_id: user_id_of(user),
        display_name: user.full_name(),
        handle: user.username.clone(),
        is_premium: user.is_premium,
        is_bot: user.is_bot,
        ..UserProfile::default()
    }
}

/// Engine participant kind of a Telegram member status.
#[must_use]
pub fn participant_kind(kind: &ChatMemberKind) -> ParticipantKind {
    match kind {
        ChatMemberKind::Owner(_) => ParticipantKind::Creator,
        ChatMemberKind::Administrator(_) => ParticipantKind::Administrator,
        ChatMemberKind::Restricted(restricted) => ParticipantKind::Restricted {
            is_member: restricted.is_member,
        },
        ChatMemberKind::Left => ParticipantKind::Left,
        ChatMemberKind::Banned(_) => ParticipantKind::Banned,
        _ => ParticipantKind::Member,
    }
}

fn participant_of(member: &ChatMember) -> Participant {
    Participant {
        profile: profile_of(&member.user),
        kind: participant_kind(&member.kind),
        joined_at: None,
    }
}

/// Chat kind derived from the id.
///
/// Channels share the supergroup id range; both allow rejoin after a kick.
#[must_use]
pub const fn chat_kind_of(chat_id: i64) -> ChatKind {
    if chat_id > 0 {
        ChatKind::Private
    } else if chat_id <= SUPERGROUP_ID_THRESHOLD {
        ChatKind::Supergroup
    } else {
        ChatKind::Group
    }
}

/// Map a teloxide failure onto the engine's taxonomy.
#[must_use]
pub fn map_request_error(err: &RequestError) -> GatewayError {
    match err {
        RequestError::RetryAfter(wait) => GatewayError::RateLimited {
            wait: wait.duration(),
        },
        RequestError::Network(e) => GatewayError::Transient(e.to_string()),
        RequestError::Io(e) => GatewayError::Transient(e.to_string()),
        RequestError::Api(api) => classify_api_error(&api.to_string()),
        RequestError::MigrateToChatId(new_id) => {
            GatewayError::NotFound(format!("chat migrated to {new_id}"))
        }
        other => GatewayError::Unexpected(other.to_string()),
    }
}

/// Classify a Bot API error description.
///
/// Only chat-level failures become `PermissionDenied`/`NotFound`, since those
/// untrack the chat. Refusals concerning one user (an admin, the owner) stay
/// `Unexpected` so only that item is skipped.
#[must_use]
pub fn classify_api_error(description: &str) -> GatewayError {
    let text = description.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(&["user not found", "participant_id_invalid", "member not found", "user_id_invalid"]) {
        GatewayError::MemberNotFound(description.to_string())
    } else if any(&["chat not found", "peer_id_invalid", "group chat was deactivated"]) {
        GatewayError::NotFound(description.to_string())
    } else if any(&["user is an administrator", "can't remove chat owner", "user_admin_invalid"]) {
        GatewayError::Unexpected(description.to_string())
    } else if any(&[
        "not enough rights",
        "bot was kicked",
        "not a member",
        "chat_admin_required",
        "have no rights",
        "forbidden",
    ]) {
        GatewayError::PermissionDenied(description.to_string())
    } else {
        GatewayError::Unexpected(description.to_string())
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn list_participants(&self, chat_id: i64) -> Result<Vec<Participant>, GatewayError> {
        let mut roster = self
            .store
            .list_member_ids(chat_id, StatusFilter::Active)
            .await
            .map_err(|e| GatewayError::Unexpected(format!("roster unavailable: {e}")))?;
        let admins = self
            .bot
            .get_chat_administrators(ChatId(chat_id))
            .await
            .map_err(|e| map_request_error(&e))?;

        let mut participants: Vec<Participant> = admins.iter().map(participant_of).collect();
        for admin in &participants {
            roster.remove(&admin.user_id());
        }

        let probes: Vec<(i64, Result<Participant, GatewayError>)> = stream::iter(roster)
            .map(|user_id| async move { (user_id, self.get_member(chat_id, user_id).await) })
            .buffer_unordered(self.probe_concurrency)
            .collect()
            .await;

        for (user_id, probe) in probes {
            match probe {
                // Departed users are returned too so the sweeper need not ask again
                Ok(participant) => participants.push(participant),
                Err(e) if e.is_chat_loss() => return Err(e),
                // Omitted users get an authoritative lookup from the sweeper
                Err(e) => debug!(chat_id, user_id, error = %e, "Roster probe failed"),
            }
        }
        Ok(participants)
    }

    fn supports_ban_list(&self, _chat_id: i64) -> bool {
        false
    }

    async fn list_banned(&self, _chat_id: i64) -> Result<Vec<i64>, GatewayError> {
        Err(GatewayError::Unexpected(
            "the Bot API cannot list banned users".into(),
        ))
    }

    async fn get_administrators(&self, chat_id: i64) -> Result<Vec<i64>, GatewayError> {
        let admins = self
            .bot
            .get_chat_administrators(ChatId(chat_id))
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(admins.iter().map(|m| user_id_of(&m.user)).collect())
    }

    async fn get_member(&self, chat_id: i64, user_id: i64) -> Result<Participant, GatewayError> {
        let member = self
            .bot
            .get_chat_member(ChatId(chat_id), telegram_user(user_id))
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(participant_of(&member))
    }

    async fn chat_info(&self, chat_id: i64) -> Result<ChatInfo, GatewayError> {
        let chat = self
            .bot
            .get_chat(ChatId(chat_id))
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(ChatInfo {
            chat_id,
            title: chat.title().map(str::to_owned),
            kind: chat_kind_of(chat_id),
        })
    }

    fn chat_kind(&self, chat_id: i64) -> ChatKind {
        chat_kind_of(chat_id)
    }

    async fn kick(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.ban(chat_id, user_id).await?;
        self.bot
            .unban_chat_member(ChatId(chat_id), telegram_user(user_id))
            .only_if_banned(true)
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(())
    }

    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.bot
            .ban_chat_member(ChatId(chat_id), telegram_user(user_id))
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(())
    }

    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.bot
            .unban_chat_member(ChatId(chat_id), telegram_user(user_id))
            .only_if_banned(true)
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: String) -> Result<(), GatewayError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map_err(|e| map_request_error(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_level_errors() {
        assert!(matches!(
            classify_api_error("Bad Request: user not found"),
            GatewayError::MemberNotFound(_)
        ));
        assert!(matches!(
            classify_api_error("Bad Request: PARTICIPANT_ID_INVALID"),
            GatewayError::MemberNotFound(_)
        ));
    }

    #[test]
    fn test_chat_level_errors_are_chat_loss() {
        for text in [
            "Bad Request: chat not found",
            "Forbidden: bot was kicked from the supergroup chat",
            "Bad Request: not enough rights to restrict/unrestrict chat member",
            "Forbidden: bot is not a member of the supergroup chat",
            "Bad Request: CHAT_ADMIN_REQUIRED",
        ] {
            assert!(classify_api_error(text).is_chat_loss(), "{text}");
        }
    }

    #[test]
    fn test_refusals_for_one_user_keep_the_chat() {
        let err = classify_api_error("Bad Request: user is an administrator of the chat");
        assert!(!err.is_chat_loss());
        assert!(matches!(err, GatewayError::Unexpected(_)));
        assert!(matches!(
            classify_api_error("Bad Request: message text is empty"),
            GatewayError::Unexpected(_)
        ));
    }

    #[test]
    fn test_chat_kind_from_id() {
        assert_eq!(chat_kind_of(42), ChatKind::Private);
        assert_eq!(chat_kind_of(-4_012_345_678), ChatKind::Group);
        assert_eq!(chat_kind_of(-1_001_234_567_890), ChatKind::Supergroup);
        assert!(chat_kind_of(-1_001_234_567_890).allows_rejoin_after_kick());
    }

    #[test]
    fn test_left_kind() {
        assert_eq!(participant_kind(&ChatMemberKind::Left), ParticipantKind::Left);
        assert!(!participant_kind(&ChatMemberKind::Left).is_present());
    }
}
