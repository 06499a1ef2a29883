//! Hand-written platform fake shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use lurkwarden_core::config::{EngineTuning, ModerationSettings};
use lurkwarden_core::gateway::{ChatGateway, ChatInfo, ChatKind, GatewayError, Participant};
use lurkwarden_core::model::{ChatConfigUpdate, ParticipantKind, Status, Transition, UserProfile};
use lurkwarden_core::moderator::Moderator;
use lurkwarden_core::storage::{MembershipStore, MemoryStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A mutating platform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Kick(i64, i64),
    Ban(i64, i64),
    Unban(i64, i64),
}

#[derive(Default)]
struct FakeState {
    present: HashMap<i64, Vec<i64>>,
    departed: HashMap<i64, Vec<(i64, ParticipantKind)>>,
    lookups_made: Vec<(i64, i64)>,
    lookups: HashMap<(i64, i64), Result<ParticipantKind, GatewayError>>,
    admins: HashMap<i64, Vec<i64>>,
    banned: HashMap<i64, HashSet<i64>>,
    failures: HashMap<(&'static str, i64), VecDeque<GatewayError>>,
    calls: Vec<Call>,
    sent: Vec<(i64, String)>,
}

/// In-memory platform: enumeration, point lookups and actions with scripted failures.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
    action_delay: Duration,
    list_delay: Duration,
    ban_list: bool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kick/ban takes this long.
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    /// Every enumeration takes this long.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Expose the ban list.
    pub fn with_ban_list(mut self) -> Self {
        self.ban_list = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state")
    }

    pub fn set_present(&self, chat_id: i64, users: impl IntoIterator<Item = i64>) {
        self.state().present.insert(chat_id, users.into_iter().collect());
    }

    /// Departed users the enumeration reports alongside the present ones.
    pub fn set_departed(&self, chat_id: i64, users: Vec<(i64, ParticipantKind)>) {
        self.state().departed.insert(chat_id, users);
    }

    /// Point lookups issued so far.
    pub fn lookups_made(&self) -> Vec<(i64, i64)> {
        self.state().lookups_made.clone()
    }

    pub fn set_admins(&self, chat_id: i64, admins: Vec<i64>) {
        self.state().admins.insert(chat_id, admins);
    }

    pub fn set_banned(&self, chat_id: i64, users: impl IntoIterator<Item = i64>) {
        self.state().banned.insert(chat_id, users.into_iter().collect());
    }

    /// Override the point lookup of one user.
    pub fn set_lookup(&self, chat_id: i64, user_id: i64, result: Result<ParticipantKind, GatewayError>) {
        self.state().lookups.insert((chat_id, user_id), result);
    }

    /// Fail the next `count` calls of `action` ("kick" / "ban") for `user_id`.
    pub fn fail_action(&self, action: &'static str, user_id: i64, err: GatewayError, count: usize) {
        self.state()
            .failures
            .entry((action, user_id))
            .or_default()
            .extend(std::iter::repeat_n(err, count));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.state().sent.clone()
    }

    async fn act(&self, action: &'static str, chat_id: i64, user_id: i64, call: Call) -> Result<(), GatewayError> {
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        let mut state = self.state();
        if let Some(err) = state.failures.get_mut(&(action, user_id)).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        state.calls.push(call);
        if let Some(present) = state.present.get_mut(&chat_id) {
            present.retain(|id| *id != user_id);
        }
        if action == "ban" {
            state.banned.entry(chat_id).or_default().insert(user_id);
        }
        Ok(())
    }
}

fn participant(user_id: i64, kind: ParticipantKind) -> Participant {
    Participant {
        profile: UserProfile::new(user_id, format!("user{user_id}")),
        kind,
        joined_at: None,
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn list_participants(&self, chat_id: i64) -> Result<Vec<Participant>, GatewayError> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        let state = self.state();
        let admins = state.admins.get(&chat_id).cloned().unwrap_or_default();
        let departed = state
            .departed
            .get(&chat_id)
            .into_iter()
            .flatten()
            .map(|&(id, kind)| participant(id, kind));
        Ok(state
            .present
            .get(&chat_id)
            .map(|users| {
                users
                    .iter()
                    .map(|&id| {
                        let kind = if admins.contains(&id) {
                            ParticipantKind::Administrator
                        } else {
                            ParticipantKind::Member
                        };
                        participant(id, kind)
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
            .into_iter()
            .chain(departed)
            .collect())
    }

    fn supports_ban_list(&self, _chat_id: i64) -> bool {
        self.ban_list
    }

    async fn list_banned(&self, chat_id: i64) -> Result<Vec<i64>, GatewayError> {
        Ok(self
            .state()
            .banned
            .get(&chat_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_administrators(&self, chat_id: i64) -> Result<Vec<i64>, GatewayError> {
        Ok(self.state().admins.get(&chat_id).cloned().unwrap_or_default())
    }

    async fn get_member(&self, chat_id: i64, user_id: i64) -> Result<Participant, GatewayError> {
        let mut state = self.state();
        state.lookups_made.push((chat_id, user_id));
        if let Some(result) = state.lookups.get(&(chat_id, user_id)) {
            return result.clone().map(|kind| participant(user_id, kind));
        }
        let present = state
            .present
            .get(&chat_id)
            .is_some_and(|users| users.contains(&user_id));
        let banned = state
            .banned
            .get(&chat_id)
            .is_some_and(|users| users.contains(&user_id));
        let kind = match (present, banned) {
            (true, _) => ParticipantKind::Member,
            (false, true) => ParticipantKind::Banned,
            (false, false) => ParticipantKind::Left,
        };
        Ok(participant(user_id, kind))
    }

    async fn chat_info(&self, chat_id: i64) -> Result<ChatInfo, GatewayError> {
        Ok(ChatInfo {
            chat_id,
            title: None,
            kind: ChatKind::Supergroup,
        })
    }

    fn chat_kind(&self, _chat_id: i64) -> ChatKind {
        ChatKind::Supergroup
    }

    async fn kick(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.act("kick", chat_id, user_id, Call::Kick(chat_id, user_id)).await
    }

    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.act("ban", chat_id, user_id, Call::Ban(chat_id, user_id)).await
    }

    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), GatewayError> {
        self.state().calls.push(Call::Unban(chat_id, user_id));
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: String) -> Result<(), GatewayError> {
        self.state().sent.push((chat_id, text));
        Ok(())
    }
}

/// Tunables without transient backoff.
pub fn tuning() -> EngineTuning {
    EngineTuning {
        transient_backoff: Duration::ZERO,
        drain_poll: Duration::from_millis(10),
        ..EngineTuning::default()
    }
}

/// Engine wired to a fake platform and an in-memory store.
pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub store: Arc<MemoryStore>,
    pub moderator: Moderator,
}

impl Harness {
    pub fn new(gateway: FakeGateway) -> Self {
        Self::with_tuning(gateway, tuning())
    }

    pub fn with_tuning(gateway: FakeGateway, tuning: EngineTuning) -> Self {
        let gateway = Arc::new(gateway);
        let store = Arc::new(MemoryStore::in_memory());
        let moderator = Moderator::new(
            gateway.clone(),
            store.clone(),
            &ModerationSettings::default(),
            tuning,
        );
        Self {
            gateway,
            store,
            moderator,
        }
    }

    /// Persist users as plain members.
    pub async fn seed_members(&self, chat_id: i64, users: impl IntoIterator<Item = i64>) {
        let batch = users
            .into_iter()
            .map(|id| {
                (
                    id,
                    Transition::Joined {
                        profile: UserProfile::new(id, format!("user{id}")),
                        status: Status::Member,
                        joined_at: None,
                        observed_at: Utc::now(),
                    },
                )
            })
            .collect();
        self.store
            .upsert_members(chat_id, batch)
            .await
            .expect("seed members");
    }

    /// Mark the chat as swept just now.
    pub async fn mark_fresh(&self, chat_id: i64) {
        self.store
            .update_chat_config(chat_id, ChatConfigUpdate::MarkSwept(Utc::now()))
            .await
            .expect("mark fresh");
    }

    pub async fn status(&self, chat_id: i64, user_id: i64) -> Option<Status> {
        self.store
            .get_member(user_id, chat_id)
            .await
            .expect("read member")
            .map(|r| r.status)
    }
}
