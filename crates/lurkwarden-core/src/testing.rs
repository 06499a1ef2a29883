//! Testing helpers and mock utilities.
//!
//! Provides constructors for mocked gateways and a fully wired engine over
//! the in-memory store.

use crate::config::{EngineTuning, ModerationSettings};
use crate::gateway::{ChatKind, MockChatGateway, Participant};
use crate::model::{ChatConfigUpdate, ParticipantKind, Transition, UserProfile};
use crate::moderator::Moderator;
use crate::storage::{MembershipStore, MemoryStore};
use chrono::Utc;
use mockall::predicate::*;
use std::sync::Arc;
use std::time::Duration;

/// Participant with a generated display name.
#[must_use]
pub fn participant(user_id: i64, kind: ParticipantKind) -> Participant {
    Participant {
        profile: UserProfile::new(user_id, format!("user{user_id}")),
        kind,
        joined_at: None,
    }
}

/// Mock gateway for a supergroup with the given admins.
///
/// `chat_kind`, `supports_ban_list`, `get_administrators` and `send_message`
/// are pre-programmed; mutating calls are left for the test to expect.
#[must_use]
pub fn mock_gateway(admins: Vec<i64>) -> MockChatGateway {
    let mut mock = MockChatGateway::new();
    mock.expect_chat_kind()
        .with(always())
        .returning(|_| ChatKind::Supergroup);
    mock.expect_supports_ban_list().returning(|_| false);
    mock.expect_get_administrators()
        .returning(move |_| Ok(admins.clone()));
    mock.expect_send_message().returning(|_, _| Ok(()));
    mock
}

/// Tunables with no retry backoff so tests do not sleep.
#[must_use]
pub fn fast_tuning() -> EngineTuning {
    EngineTuning {
        transient_backoff: Duration::ZERO,
        drain_poll: Duration::from_millis(5),
        ..EngineTuning::default()
    }
}

/// Moderator over a fresh in-memory store.
#[must_use]
pub fn moderator_with(gateway: MockChatGateway) -> (Moderator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::in_memory());
    let moderator = Moderator::new(
        Arc::new(gateway),
        store.clone(),
        &ModerationSettings::default(),
        fast_tuning(),
    );
    (moderator, store)
}

/// Track a chat whose last sweep finished just now.
pub async fn fresh_chat(store: &MemoryStore, chat_id: i64) {
    store
        .update_chat_config(chat_id, ChatConfigUpdate::MarkSwept(Utc::now()))
        .await
        .expect("store write");
}

/// Persist a user as a plain member.
pub async fn seed_member(store: &MemoryStore, chat_id: i64, user_id: i64) {
    store
        .upsert_member(
            chat_id,
            user_id,
            Transition::Joined {
                profile: UserProfile::new(user_id, format!("user{user_id}")),
                status: crate::model::Status::Member,
                joined_at: None,
                observed_at: Utc::now(),
            },
        )
        .await
        .expect("store write");
}
