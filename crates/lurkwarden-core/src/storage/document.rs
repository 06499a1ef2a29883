use crate::model::{
    ActivityRecord, ChatConfig, CounterKind, EscalationRecord, MemberRecord, StatusFilter,
    Transition,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Everything persisted for one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDocument {
    /// Chat configuration.
    pub config: ChatConfig,
    /// Membership records by user id.
    #[serde(default)]
    pub members: HashMap<i64, MemberRecord>,
    /// Activity tracking by user id.
    #[serde(default)]
    pub activity: HashMap<i64, ActivityRecord>,
    /// Inactivity kick counters.
    #[serde(default)]
    pub kicks: HashMap<i64, EscalationRecord>,
    /// Ban counters.
    #[serde(default)]
    pub bans: HashMap<i64, EscalationRecord>,
    /// Whitelisted user ids.
    #[serde(default)]
    pub whitelist: BTreeSet<i64>,
}

impl ChatDocument {
    /// Empty document for a newly tracked chat.
    #[must_use]
    pub fn new(chat_id: i64) -> Self {
        Self {
            config: ChatConfig::new(chat_id),
            members: HashMap::new(),
            activity: HashMap::new(),
            kicks: HashMap::new(),
            bans: HashMap::new(),
            whitelist: BTreeSet::new(),
        }
    }

    /// Chat id of the document.
    #[must_use]
    pub const fn chat_id(&self) -> i64 {
        self.config.chat_id
    }

    /// Apply a transition, creating the record on first sight.
    pub fn apply(&mut self, user_id: i64, transition: &Transition) -> &MemberRecord {
        let chat_id = self.chat_id();
        let record = self
            .members
            .entry(user_id)
            .or_insert_with(|| MemberRecord::new(user_id, chat_id));
        record.apply(transition);
        record
    }

    /// Records passing a status filter.
    pub fn members_matching(&self, filter: StatusFilter) -> impl Iterator<Item = &MemberRecord> {
        self.members
            .values()
            .filter(move |record| filter.matches(record.status))
    }

    /// Case-insensitive handle lookup; a leading `@` is ignored.
    #[must_use]
    pub fn find_by_handle(&self, handle: &str) -> Option<&MemberRecord> {
        let wanted = handle.trim().trim_start_matches('@');
        if wanted.is_empty() {
            return None;
        }
        self.members.values().find(|record| {
            record
                .handle
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(wanted))
        })
    }

    /// Counter table for a kind.
    pub fn counters_mut(&mut self, kind: CounterKind) -> &mut HashMap<i64, EscalationRecord> {
        match kind {
            CounterKind::Kick => &mut self.kicks,
            CounterKind::Ban => &mut self.bans,
        }
    }

    /// Counter value, zero when absent.
    #[must_use]
    pub fn counter(&self, kind: CounterKind, user_id: i64) -> EscalationRecord {
        let table = match kind {
            CounterKind::Kick => &self.kicks,
            CounterKind::Ban => &self.bans,
        };
        table.get(&user_id).copied().unwrap_or_default()
    }
}
