//! Membership updates and group messages fed to the engine.

use crate::gateway::{participant_kind, profile_of, user_id_of};
use lurkwarden_core::events::{MemberEvent, MessageEvent};
use lurkwarden_core::moderator::Moderator;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatMemberUpdated;
use tracing::{debug, error};

/// Engine event of a `chat_member` update. Private chats yield nothing.
#[must_use]
pub fn member_event(update: &ChatMemberUpdated) -> Option<MemberEvent> {
    if update.chat.is_private() {
        return None;
    }
    Some(MemberEvent {
        chat_id: update.chat.id.0,
        chat_title: update.chat.title().map(str::to_owned),
        user: profile_of(&update.new_chat_member.user),
        actor_id: Some(user_id_of(&update.from)),
        old: participant_kind(&update.old_chat_member.kind),
        new: participant_kind(&update.new_chat_member.kind),
        at: update.date,
    })
}

/// Engine event of a group message.
///
/// Service messages about joins and leaves are skipped since the matching
/// `chat_member` update carries them, as are bot senders (anonymous admins post
/// through one).
#[must_use]
pub fn message_event(msg: &Message) -> Option<MessageEvent> {
    if msg.chat.is_private()
        || msg.new_chat_members().is_some()
        || msg.left_chat_member().is_some()
    {
        return None;
    }
    let user = msg.from.as_ref().filter(|u| !u.is_bot)?;
    Some(MessageEvent {
        chat_id: msg.chat.id.0,
        chat_title: msg.chat.title().map(str::to_owned),
        user: profile_of(user),
        has_qualifying_media: msg.photo().is_some()
            || msg.video().is_some()
            || msg.document().is_some(),
        at: msg.date,
    })
}

/// Endpoint for `chat_member` updates.
pub async fn handle_member_update(
    update: ChatMemberUpdated,
    moderator: Arc<Moderator>,
) -> ResponseResult<()> {
    let Some(event) = member_event(&update) else {
        return respond(());
    };
    let (chat_id, user_id) = (event.chat_id, event.user.user_id);
    match moderator.event_handler().handle_member_event(event).await {
        Ok(outcome) => debug!(chat_id, user_id, ?outcome, "Member update handled"),
        Err(e) => error!(chat_id, user_id, error = %e, "Member update failed"),
    }
    respond(())
}

/// Endpoint for non-command group messages.
pub async fn handle_group_message(msg: Message, moderator: Arc<Moderator>) -> ResponseResult<()> {
    let Some(event) = message_event(&msg) else {
        return respond(());
    };
    let (chat_id, user_id) = (event.chat_id, event.user.user_id);
    match moderator.event_handler().handle_message(event).await {
        Ok(outcome) => debug!(chat_id, user_id, ?outcome, "Message handled"),
        Err(e) => error!(chat_id, user_id, error = %e, "Message handling failed"),
    }
    respond(())
}
