//! Moderation executor.
//!
//! Runs inactivity purges in concurrent batches and performs the single-user
//! removals requested by the sweeper, the enforcer and the event handler. All
//! platform calls go through [`RetryPolicy`].

use crate::admin_cache::AdminCache;
use crate::coordination::Coordinator;
use crate::error::ModerationError;
use crate::exemption::ExemptKeywords;
use crate::gateway::{ChatGateway, ChatKind, GatewayError};
use crate::model::{
    ActivityRecord, CounterKind, MemberRecord, Status, StatusFilter, Transition,
};
use crate::retry::RetryPolicy;
use crate::storage::MembershipStore;
use crate::utils::instant_before;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Caller-selected purge action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Remove, allowing rejoin where the chat supports it.
    Kick,
    /// Ban.
    Ban,
}

/// How a single user is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    /// Ban then unban when the chat allows rejoin, otherwise a plain ban.
    Kick,
    /// Permanent ban.
    Ban,
}

/// Parameters of a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeRequest {
    /// Target chat.
    pub chat_id: i64,
    /// Users without a qualifying post within this span are eligible.
    pub cutoff: Duration,
    /// Caller mode.
    pub mode: PurgeMode,
    /// Report only, no mutating calls.
    pub pretend: bool,
}

/// A user selected for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// User id.
    pub user_id: i64,
    /// `@handle` or display name.
    pub name: String,
    /// Last qualifying post.
    pub last_posted: Option<DateTime<Utc>>,
}

/// Outcome of a purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Target chat.
    pub chat_id: i64,
    /// Caller mode.
    pub mode: PurgeMode,
    /// Whether this was a dry run.
    pub pretend: bool,
    /// Posts before this instant did not count.
    pub cutoff_at: DateTime<Utc>,
    /// Users removed with the option to rejoin.
    pub kicked: Vec<Candidate>,
    /// Users banned.
    pub banned: Vec<Candidate>,
    /// Users left alone after the retry ceiling or a permanent error.
    pub skipped: Vec<Candidate>,
}

impl PurgeReport {
    /// Number of eligible users.
    #[must_use]
    pub fn eligible(&self) -> usize {
        self.kicked.len() + self.banned.len() + self.skipped.len()
    }
}

/// Users eligible for an inactivity purge.
///
/// Eligible: plain active member, not exempt, and either untracked or without
/// a qualifying post since `cutoff_at`.
#[must_use]
pub fn select_eligible(
    members: &[MemberRecord],
    activity: &HashMap<i64, ActivityRecord>,
    cutoff_at: DateTime<Utc>,
    keywords: &ExemptKeywords,
    admins: &HashSet<i64>,
    whitelist: &HashSet<i64>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = members
        .iter()
        .filter(|record| record.status == Status::Member)
        .filter(|record| {
            !keywords.is_exempt(record.user_id, record.handle.as_deref(), admins, whitelist)
        })
        .filter_map(|record| {
            let last_posted = activity.get(&record.user_id).and_then(|a| a.last_posted);
            let inactive = last_posted.is_none_or(|posted| posted < cutoff_at);
            inactive.then(|| Candidate {
                user_id: record.user_id,
                name: record.profile().mention(),
                last_posted,
            })
        })
        .collect();
    candidates.sort_by_key(|c| c.user_id);
    candidates
}

/// Pick the action for one user.
#[must_use]
pub const fn decide_action(mode: PurgeMode, three_strikes_mode: bool, kick_count: u32) -> RemovalKind {
    if three_strikes_mode && kick_count >= 2 {
        return RemovalKind::Ban;
    }
    match mode {
        PurgeMode::Kick => RemovalKind::Kick,
        PurgeMode::Ban => RemovalKind::Ban,
    }
}

/// Split `items` into at most `num_batches` contiguous, near-equal batches.
#[must_use]
pub fn partition_batches<T>(items: Vec<T>, num_batches: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let batch_size = items.len().div_ceil(num_batches.max(1));
    let mut batches = Vec::new();
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(batch_size).collect());
    }
    batches
}

enum Outcome {
    Removed(RemovalKind),
    Skipped,
}

/// Batched, rate-limit aware kick/ban runner.
pub struct ModerationExecutor {
    gateway: Arc<dyn ChatGateway>,
    store: Arc<dyn MembershipStore>,
    coordinator: Arc<Coordinator>,
    admin_cache: Arc<AdminCache>,
    keywords: ExemptKeywords,
    retry: RetryPolicy,
    num_batches: usize,
}

impl ModerationExecutor {
    /// Create the executor.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<dyn MembershipStore>,
        coordinator: Arc<Coordinator>,
        admin_cache: Arc<AdminCache>,
        keywords: ExemptKeywords,
        retry: RetryPolicy,
        num_batches: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            coordinator,
            admin_cache,
            keywords,
            retry,
            num_batches: num_batches.max(1),
        }
    }

    /// Remove inactive users from a chat.
    ///
    /// Holds the purge lock for the whole run and suspends sweeps; waits for
    /// in-flight sweeps to drain before reading the membership model.
    ///
    /// # Errors
    ///
    /// `PurgeInProgress` if another purge runs, `ChatNotTracked` for unknown
    /// chats, gateway errors from the admin lookup and storage errors from reads.
    pub async fn run_purge(&self, request: PurgeRequest) -> Result<PurgeReport, ModerationError> {
        let Some(_purge) = self.coordinator.try_begin_purge() else {
            return Err(ModerationError::PurgeInProgress);
        };
        let chat_id = request.chat_id;
        info!(chat_id, mode = ?request.mode, pretend = request.pretend, "Purge requested");
        self.coordinator.wait_for_sweeps_to_drain().await;

        let config = self
            .store
            .get_chat_config(chat_id)
            .await?
            .ok_or(ModerationError::ChatNotTracked(chat_id))?;
        let admins = self.admin_cache.admins(chat_id).await?;
        let members = self.store.list_members(chat_id, StatusFilter::Active).await?;
        let activity = self.store.list_activity(chat_id).await?;
        let whitelist = self.store.list_whitelist(chat_id).await?;

        let now = Utc::now();
        let cutoff_at = instant_before(now, request.cutoff);
        let candidates = select_eligible(
            &members,
            &activity,
            cutoff_at,
            &self.keywords,
            &admins,
            &whitelist,
        );
        info!(chat_id, eligible = candidates.len(), %cutoff_at, "Purge candidates selected");

        let chat_kind = self.gateway.chat_kind(chat_id);
        let batches = partition_batches(candidates, self.num_batches);
        let outcomes = join_all(batches.into_iter().map(|batch| {
            self.process_batch(chat_id, batch, request, config.three_strikes_mode, chat_kind)
        }))
        .await;

        let mut report = PurgeReport {
            chat_id,
            mode: request.mode,
            pretend: request.pretend,
            cutoff_at,
            kicked: Vec::new(),
            banned: Vec::new(),
            skipped: Vec::new(),
        };
        for (candidate, outcome) in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Removed(RemovalKind::Kick) => report.kicked.push(candidate),
                Outcome::Removed(RemovalKind::Ban) => report.banned.push(candidate),
                Outcome::Skipped => report.skipped.push(candidate),
            }
        }

        if !request.pretend {
            self.persist_purge(&report).await;
        }
        info!(
            chat_id,
            kicked = report.kicked.len(),
            banned = report.banned.len(),
            skipped = report.skipped.len(),
            pretend = report.pretend,
            "Purge finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        chat_id: i64,
        batch: Vec<Candidate>,
        request: PurgeRequest,
        three_strikes_mode: bool,
        chat_kind: ChatKind,
    ) -> Vec<(Candidate, Outcome)> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for candidate in batch {
            let user_id = candidate.user_id;
            let kick_count = match self.store.get_counter(user_id, chat_id, CounterKind::Kick).await {
                Ok(counter) => counter.count,
                Err(e) => {
                    warn!(chat_id, user_id, error = %e, "Kick counter unreadable, skipping user");
                    outcomes.push((candidate, Outcome::Skipped));
                    continue;
                }
            };
            let action = decide_action(request.mode, three_strikes_mode, kick_count);
            if request.pretend {
                outcomes.push((candidate, Outcome::Removed(action)));
                continue;
            }
            match self.execute(chat_id, user_id, action, chat_kind).await {
                Ok(()) => {
                    info!(chat_id, user_id, ?action, kick_number = kick_count + 1, "User removed");
                    outcomes.push((candidate, Outcome::Removed(action)));
                }
                Err(e) => {
                    warn!(chat_id, user_id, error = %e, "User not removed");
                    outcomes.push((candidate, Outcome::Skipped));
                }
            }
        }
        outcomes
    }

    async fn persist_purge(&self, report: &PurgeReport) {
        let chat_id = report.chat_id;
        let now = Utc::now();
        let removed = report
            .kicked
            .iter()
            .map(|c| (c, RemovalKind::Kick))
            .chain(report.banned.iter().map(|c| (c, RemovalKind::Ban)));
        let mut transitions = Vec::new();
        for (candidate, kind) in removed {
            let user_id = candidate.user_id;
            if let Err(e) = self
                .store
                .increment_counter(user_id, chat_id, CounterKind::Kick, now, candidate.last_posted)
                .await
            {
                warn!(chat_id, user_id, error = %e, "Failed to record kick");
            }
            let transition = match kind {
                RemovalKind::Kick => Transition::Kicked { at: now },
                RemovalKind::Ban => {
                    if let Err(e) = self
                        .store
                        .increment_counter(user_id, chat_id, CounterKind::Ban, now, candidate.last_posted)
                        .await
                    {
                        warn!(chat_id, user_id, error = %e, "Failed to record ban");
                    }
                    Transition::Banned { at: now }
                }
            };
            transitions.push((user_id, transition));
        }
        let removed_ids: Vec<i64> = transitions.iter().map(|(id, _)| *id).collect();
        if let Err(e) = self.store.upsert_members(chat_id, transitions).await {
            warn!(chat_id, error = %e, "Failed to persist purge transitions");
        }
        if let Err(e) = self.store.delete_activities(chat_id, removed_ids).await {
            warn!(chat_id, error = %e, "Failed to drop activity of removed users");
        }
    }

    async fn execute(
        &self,
        chat_id: i64,
        user_id: i64,
        kind: RemovalKind,
        chat_kind: ChatKind,
    ) -> Result<(), GatewayError> {
        match kind {
            RemovalKind::Kick if chat_kind.allows_rejoin_after_kick() => {
                self.retry
                    .run("kick", || self.gateway.kick(chat_id, user_id))
                    .await
            }
            RemovalKind::Kick | RemovalKind::Ban => {
                self.retry
                    .run("ban", || self.gateway.ban(chat_id, user_id))
                    .await
            }
        }
    }

    /// Remove one user without touching escalation counters.
    ///
    /// Records the Kicked/Banned transition and stops activity tracking.
    ///
    /// # Errors
    ///
    /// Returns the gateway error once retries are exhausted, or a storage error.
    pub async fn remove_user(
        &self,
        chat_id: i64,
        user_id: i64,
        kind: RemovalKind,
    ) -> Result<(), ModerationError> {
        let chat_kind = self.gateway.chat_kind(chat_id);
        self.execute(chat_id, user_id, kind, chat_kind).await?;
        let now = Utc::now();
        let transition = match kind {
            RemovalKind::Kick => Transition::Kicked { at: now },
            RemovalKind::Ban => Transition::Banned { at: now },
        };
        self.store.upsert_member(chat_id, user_id, transition).await?;
        self.store.delete_activity(user_id, chat_id).await?;
        Ok(())
    }

    /// Ban one user as a policy action and bump their ban counter.
    ///
    /// # Errors
    ///
    /// Returns the gateway error once retries are exhausted, or a storage error.
    pub async fn ban_user(&self, chat_id: i64, user_id: i64) -> Result<(), ModerationError> {
        self.remove_user(chat_id, user_id, RemovalKind::Ban).await?;
        self.store
            .increment_counter(user_id, chat_id, CounterKind::Ban, Utc::now(), None)
            .await?;
        info!(chat_id, user_id, "User banned by policy");
        Ok(())
    }

    /// Removal kind that lets the user back in later when the chat allows it.
    #[must_use]
    pub fn rejoinable_removal(&self, chat_id: i64) -> RemovalKind {
        if self.gateway.chat_kind(chat_id).allows_rejoin_after_kick() {
            RemovalKind::Kick
        } else {
            RemovalKind::Ban
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserProfile;
    use proptest::prelude::*;

    fn member(user_id: i64, status: Status, handle: Option<&str>) -> MemberRecord {
        let mut record = MemberRecord::new(user_id, -1);
        let mut profile = UserProfile::new(user_id, format!("user{user_id}"));
        profile.handle = handle.map(str::to_string);
        record.apply(&Transition::Joined {
            profile,
            status,
            joined_at: None,
            observed_at: Utc::now(),
        });
        record
    }

    #[test]
    fn test_select_eligible_respects_activity_and_exemptions() {
        let now = Utc::now();
        let cutoff_at = now - chrono::Duration::days(1);
        let members = vec![
            member(1, Status::Member, None),            // never tracked
            member(2, Status::Member, None),            // tracked, never posted
            member(3, Status::Member, None),            // posted recently
            member(4, Status::Member, None),            // posted long ago
            member(5, Status::Admin, None),             // admin status
            member(6, Status::Member, None),            // in admin set
            member(7, Status::Member, None),            // whitelisted
            member(8, Status::Member, Some("VIP_guy")), // keyword
        ];
        let activity = HashMap::from([
            (2, ActivityRecord::default()),
            (3, ActivityRecord { last_posted: Some(now) }),
            (4, ActivityRecord { last_posted: Some(now - chrono::Duration::days(3)) }),
        ]);
        let selected = select_eligible(
            &members,
            &activity,
            cutoff_at,
            &ExemptKeywords::new(["vip"]),
            &HashSet::from([6]),
            &HashSet::from([7]),
        );
        let ids: Vec<i64> = selected.iter().map(|c| c.user_id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_partition_batches() {
        assert!(partition_batches(Vec::<i64>::new(), 10).is_empty());
        let batches = partition_batches((0..25).collect::<Vec<_>>(), 10);
        assert_eq!(batches.len(), 9);
        assert!(batches.iter().all(|b| b.len() <= 3));
        assert_eq!(batches.concat(), (0..25).collect::<Vec<_>>());
        assert_eq!(partition_batches(vec![1, 2, 3], 10).len(), 3);
        assert_eq!(partition_batches(vec![1, 2, 3], 0).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_escalation_rule(kick_count in 0u32..10, ban_mode in any::<bool>(), strikes in any::<bool>()) {
            let mode = if ban_mode { PurgeMode::Ban } else { PurgeMode::Kick };
            let action = decide_action(mode, strikes, kick_count);
            if strikes && kick_count >= 2 {
                prop_assert_eq!(action, RemovalKind::Ban);
            } else if ban_mode {
                prop_assert_eq!(action, RemovalKind::Ban);
            } else {
                prop_assert_eq!(action, RemovalKind::Kick);
            }
        }

        #[test]
        fn prop_batches_bounded_and_complete(len in 0usize..200, num in 1usize..15) {
            let items: Vec<usize> = (0..len).collect();
            let batches = partition_batches(items.clone(), num);
            prop_assert!(batches.len() <= num);
            prop_assert!(batches.iter().all(|b| !b.is_empty()));
            prop_assert_eq!(batches.concat(), items);
        }

        #[test]
        fn prop_exempt_never_selected(
            whitelisted in proptest::collection::hash_set(1i64..30, 0..10),
            admins in proptest::collection::hash_set(1i64..30, 0..10),
        ) {
            let members: Vec<MemberRecord> = (1..30).map(|id| member(id, Status::Member, None)).collect();
            let selected = select_eligible(
                &members,
                &HashMap::new(),
                Utc::now(),
                &ExemptKeywords::default(),
                &admins,
                &whitelisted,
            );
            for candidate in &selected {
                prop_assert!(!admins.contains(&candidate.user_id));
                prop_assert!(!whitelisted.contains(&candidate.user_id));
            }
        }
    }
}
