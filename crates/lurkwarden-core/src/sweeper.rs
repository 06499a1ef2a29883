//! Periodic membership reconciliation.
//!
//! Each sweep enumerates a chat's live participants, diffs them against the
//! persisted model, resolves disputed ids with point lookups and applies the
//! ban-leavers, anti-rejoin and obligation policies. One chat failing never
//! affects the others.

use crate::admin_cache::{AdminCache, AdminSet};
use crate::config::EngineTuning;
use crate::coordination::Coordinator;
use crate::diagnostics::OperatorReporter;
use crate::diff::{diff_membership, LookupVerdict, MembershipDiff};
use crate::error::ModerationError;
use crate::events::EngineParts;
use crate::exemption::ExemptKeywords;
use crate::executor::ModerationExecutor;
use crate::gateway::{ChatGateway, Participant};
use crate::model::{ChatConfig, ChatConfigUpdate, Status, StatusFilter, Transition};
use crate::obligation::{ObligationEnforcer, ObligationOutcome};
use crate::retry::RetryPolicy;
use crate::storage::MembershipStore;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one chat's sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Swept chat.
    pub chat_id: i64,
    /// Participants enumerated as present.
    pub enumerated: usize,
    /// Present but not persisted as active before the sweep.
    pub newly_seen: Vec<i64>,
    /// Disputed ids confirmed present by point lookup.
    pub still_member: Vec<i64>,
    /// Confirmed leavers.
    pub left: Vec<i64>,
    /// Confirmed banned by someone else.
    pub banned_seen: Vec<i64>,
    /// Accounts that no longer exist.
    pub account_gone: Vec<i64>,
    /// Lookups that failed; records left untouched.
    pub inconclusive: Vec<i64>,
    /// Banned by ban-leavers or anti-rejoin.
    pub policy_banned: Vec<i64>,
    /// Removed by the obligation enforcer.
    pub obligation_removed: Vec<i64>,
    /// Records changed by the ban-list sync.
    pub ban_list_changes: usize,
    /// Ban policies were skipped because the previous sweep is too old.
    pub policies_suspended: bool,
}

/// Why a sweep did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A purge suspended sweeps.
    Suspended,
    /// The chat is already being swept.
    AlreadyRunning,
}

/// Result of sweeping one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Reconciled.
    Completed(SweepReport),
    /// Not run.
    Skipped(SkipReason),
    /// Access was lost; the chat is no longer tracked.
    Untracked,
    /// Failed; reported to the operator.
    Failed(String),
}

/// Admins and whitelist of a chat, loaded once per sweep.
struct ExemptView {
    admins: AdminSet,
    whitelist: HashSet<i64>,
}

impl ExemptView {
    fn is_exempt(&self, keywords: &ExemptKeywords, user_id: i64, handle: Option<&str>) -> bool {
        keywords.is_exempt(user_id, handle, &self.admins, &self.whitelist)
    }
}

/// Per-sweep context handed between the reconciliation steps.
struct SweepContext {
    chat_id: i64,
    config: ChatConfig,
    now: DateTime<Utc>,
    handles: HashMap<i64, Option<String>>,
    /// Departed users the enumeration already resolved.
    observed: HashMap<i64, Participant>,
    exempt: Option<ExemptView>,
}

impl SweepContext {
    fn is_exempt(&self, keywords: &ExemptKeywords, user_id: i64) -> bool {
        let handle = self.handles.get(&user_id).and_then(Option::as_deref);
        // Unknown admin set: never act
        self.exempt
            .as_ref()
            .is_none_or(|view| view.is_exempt(keywords, user_id, handle))
    }
}

/// Periodic full-membership diff engine.
pub struct Sweeper {
    gateway: Arc<dyn ChatGateway>,
    store: Arc<dyn MembershipStore>,
    coordinator: Arc<Coordinator>,
    admin_cache: Arc<AdminCache>,
    keywords: ExemptKeywords,
    executor: Arc<ModerationExecutor>,
    enforcer: Arc<ObligationEnforcer>,
    reporter: Arc<OperatorReporter>,
    retry: RetryPolicy,
    freshness_window: Duration,
}

impl Sweeper {
    /// Create the sweeper.
    #[must_use]
    pub fn new(parts: EngineParts, tuning: &EngineTuning) -> Self {
        Self {
            keywords: parts.exemptions.keywords().clone(),
            gateway: parts.gateway,
            store: parts.store,
            coordinator: parts.coordinator,
            admin_cache: parts.admin_cache,
            executor: parts.executor,
            enforcer: parts.enforcer,
            reporter: parts.reporter,
            retry: parts.retry,
            freshness_window: tuning.freshness_window,
        }
    }

    /// Sweep every tracked chat concurrently.
    pub async fn sweep_all(&self) -> Vec<(i64, SweepOutcome)> {
        if self.coordinator.sweeps_suspended() {
            debug!("Sweeps suspended, skipping round");
            return Vec::new();
        }
        let chat_ids = match self.store.list_chat_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                self.reporter.report("sweep", None, &e).await;
                return Vec::new();
            }
        };
        join_all(
            chat_ids
                .into_iter()
                .map(|chat_id| async move { (chat_id, self.sweep_chat(chat_id).await) }),
        )
        .await
    }

    /// Sweep one chat. The sweeping mark is released on every exit path.
    pub async fn sweep_chat(&self, chat_id: i64) -> SweepOutcome {
        if self.coordinator.sweeps_suspended() {
            return SweepOutcome::Skipped(SkipReason::Suspended);
        }
        let Some(_sweeping) = self.coordinator.try_begin_sweep(chat_id) else {
            let reason = if self.coordinator.sweeps_suspended() {
                SkipReason::Suspended
            } else {
                SkipReason::AlreadyRunning
            };
            return SweepOutcome::Skipped(reason);
        };

        match AssertUnwindSafe(self.reconcile(chat_id)).catch_unwind().await {
            Ok(Ok(report)) => SweepOutcome::Completed(report),
            Ok(Err(ModerationError::ChatNotTracked(_))) => SweepOutcome::Untracked,
            Ok(Err(e)) if e.is_chat_loss() => {
                warn!(chat_id, error = %e, "Lost access to chat, untracking");
                if let Err(e) = self.store.delete_chat(chat_id).await {
                    self.reporter.report("untrack", Some(chat_id), &e).await;
                }
                SweepOutcome::Untracked
            }
            Ok(Err(e)) => {
                self.reporter.report("sweep", Some(chat_id), &e).await;
                SweepOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.reporter.report("sweep panic", Some(chat_id), &message).await;
                SweepOutcome::Failed(message)
            }
        }
    }

    /// Run `sweep_all` every `every` until `cancel` fires.
    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = every.as_secs(), "Sweep scheduler started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Sweep scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let outcomes = self.sweep_all().await;
                    let failed = outcomes
                        .iter()
                        .filter(|(_, o)| matches!(o, SweepOutcome::Failed(_)))
                        .count();
                    debug!(chats = outcomes.len(), failed, "Sweep round finished");
                }
            }
        }
    }

    async fn reconcile(&self, chat_id: i64) -> Result<SweepReport, ModerationError> {
        let config = self
            .store
            .get_chat_config(chat_id)
            .await?
            .ok_or(ModerationError::ChatNotTracked(chat_id))?;
        let prior_records = self.store.list_members(chat_id, StatusFilter::Any).await?;
        let participants = self
            .retry
            .run("list_participants", || self.gateway.list_participants(chat_id))
            .await?;

        let now = Utc::now();
        let prior: HashMap<i64, Status> =
            prior_records.iter().map(|r| (r.user_id, r.status)).collect();
        let mut handles: HashMap<i64, Option<String>> = prior_records
            .into_iter()
            .map(|r| (r.user_id, r.handle))
            .collect();

        let mut enumerated = HashSet::new();
        let mut snapshot = Vec::new();
        let mut observed = HashMap::new();
        for participant in participants {
            let user_id = participant.user_id();
            if !participant.kind.is_present() {
                observed.insert(user_id, participant);
                continue;
            }
            enumerated.insert(user_id);
            handles.insert(user_id, participant.profile.handle.clone());
            let status = participant.kind.classify(prior.get(&user_id).copied());
            snapshot.push((
                user_id,
                Transition::Joined {
                    profile: participant.profile,
                    status,
                    joined_at: participant.joined_at,
                    observed_at: now,
                },
            ));
        }
        self.store.upsert_members(chat_id, snapshot).await?;

        let diff = diff_membership(&enumerated, &prior);
        let exempt = self.exempt_view(chat_id).await?;
        let ctx = SweepContext {
            chat_id,
            config,
            now,
            handles,
            observed,
            exempt,
        };
        let mut report = SweepReport {
            chat_id,
            enumerated: enumerated.len(),
            newly_seen: diff.newly_seen.iter().copied().collect(),
            ..SweepReport::default()
        };

        self.resolve_missing(&ctx, &diff, &mut report).await?;
        self.apply_ban_policies(&ctx, &diff, &mut report).await;
        self.sync_ban_list(&ctx, &mut report).await?;
        self.track_newcomers(&ctx, &diff).await?;
        self.enforce_obligation(&ctx, &diff, &mut report).await;

        if self
            .store
            .touch_chat_config(chat_id, ChatConfigUpdate::MarkSwept(Utc::now()))
            .await?
            .is_none()
        {
            debug!(chat_id, "Chat untracked while sweeping");
        }
        info!(
            chat_id,
            enumerated = report.enumerated,
            newly_seen = report.newly_seen.len(),
            left = report.left.len(),
            inconclusive = report.inconclusive.len(),
            policy_banned = report.policy_banned.len(),
            "Sweep completed"
        );
        Ok(report)
    }

    /// Admin set and whitelist; `None` when the admin set cannot be loaded.
    async fn exempt_view(&self, chat_id: i64) -> Result<Option<ExemptView>, ModerationError> {
        let admins = match self.admin_cache.admins(chat_id).await {
            Ok(admins) => admins,
            Err(e) if e.is_chat_loss() => return Err(e.into()),
            Err(e) => {
                warn!(chat_id, error = %e, "Admin set unavailable, policies paused this sweep");
                return Ok(None);
            }
        };
        let whitelist = self.store.list_whitelist(chat_id).await?;
        Ok(Some(ExemptView { admins, whitelist }))
    }

    /// Point lookups for persisted-active ids missing from the snapshot. Users
    /// the enumeration already reported as departed are not looked up again.
    async fn resolve_missing(
        &self,
        ctx: &SweepContext,
        diff: &MembershipDiff,
        report: &mut SweepReport,
    ) -> Result<(), ModerationError> {
        let chat_id = ctx.chat_id;
        let mut transitions = Vec::new();
        for &user_id in &diff.missing {
            let lookup = match ctx.observed.get(&user_id) {
                Some(participant) => Ok(participant.clone()),
                None => {
                    self.retry
                        .run("get_member", || self.gateway.get_member(chat_id, user_id))
                        .await
                }
            };
            if let Err(e) = &lookup {
                if e.is_chat_loss() {
                    return Err(e.clone().into());
                }
            }
            let transition = match LookupVerdict::from_lookup(&lookup) {
                Some(LookupVerdict::StillMember) => {
                    report.still_member.push(user_id);
                    continue;
                }
                Some(LookupVerdict::Left) => {
                    report.left.push(user_id);
                    Transition::Left {
                        at: ctx.now,
                        account_gone: false,
                    }
                }
                Some(LookupVerdict::Banned) => {
                    report.banned_seen.push(user_id);
                    Transition::Banned { at: ctx.now }
                }
                Some(LookupVerdict::AccountGone) => {
                    report.account_gone.push(user_id);
                    Transition::Left {
                        at: ctx.now,
                        account_gone: true,
                    }
                }
                None => {
                    debug!(chat_id, user_id, "Membership lookup inconclusive");
                    report.inconclusive.push(user_id);
                    continue;
                }
            };
            transitions.push((user_id, transition));
        }

        let gone: Vec<i64> = transitions.iter().map(|(id, _)| *id).collect();
        if gone.is_empty() {
            return Ok(());
        }
        self.store.upsert_members(chat_id, transitions).await?;
        self.store.delete_activities(chat_id, gone).await?;
        Ok(())
    }

    /// Ban-leavers and anti-rejoin, both gated on a fresh previous sweep.
    async fn apply_ban_policies(
        &self,
        ctx: &SweepContext,
        diff: &MembershipDiff,
        report: &mut SweepReport,
    ) {
        let chat_id = ctx.chat_id;
        if !ctx.config.ban_leavers_mode {
            return;
        }
        if !ctx.config.is_fresh(ctx.now, self.freshness_window) {
            warn!(chat_id, "Previous sweep too old, ban policies suspended");
            report.policies_suspended = true;
            return;
        }

        let mut targets = Vec::new();
        for &user_id in &report.left {
            if self.coordinator.take_hall_pass(chat_id, user_id).await {
                debug!(chat_id, user_id, "Hall pass consumed by sweep");
                continue;
            }
            targets.push(user_id);
        }
        targets.extend(diff.rejoined_while_banned.iter().copied());

        for user_id in targets {
            if ctx.is_exempt(&self.keywords, user_id) {
                continue;
            }
            match self.executor.ban_user(chat_id, user_id).await {
                Ok(()) => report.policy_banned.push(user_id),
                Err(e) => warn!(chat_id, user_id, error = %e, "Policy ban failed"),
            }
        }
    }

    /// Mirror the platform's ban list where it can be enumerated.
    async fn sync_ban_list(
        &self,
        ctx: &SweepContext,
        report: &mut SweepReport,
    ) -> Result<(), ModerationError> {
        let chat_id = ctx.chat_id;
        if !self.gateway.supports_ban_list(chat_id) {
            return Ok(());
        }
        let live: HashSet<i64> = match self
            .retry
            .run("list_banned", || self.gateway.list_banned(chat_id))
            .await
        {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) if e.is_chat_loss() => return Err(e.into()),
            Err(e) => {
                warn!(chat_id, error = %e, "Ban list unavailable, skipping sync");
                return Ok(());
            }
        };
        let stored = self
            .store
            .list_member_ids(chat_id, StatusFilter::Only(Status::Banned))
            .await?;

        let mut transitions: Vec<(i64, Transition)> = live
            .difference(&stored)
            .map(|&id| (id, Transition::Banned { at: ctx.now }))
            .collect();
        transitions.extend(stored.difference(&live).map(|&id| {
            (
                id,
                Transition::Left {
                    at: ctx.now,
                    account_gone: false,
                },
            )
        }));
        if transitions.is_empty() {
            return Ok(());
        }
        report.ban_list_changes = transitions.len();
        self.store.upsert_members(chat_id, transitions).await?;
        Ok(())
    }

    /// Start activity tracking for non-exempt newcomers.
    async fn track_newcomers(
        &self,
        ctx: &SweepContext,
        diff: &MembershipDiff,
    ) -> Result<(), ModerationError> {
        for &user_id in &diff.newly_seen {
            if diff.rejoined_while_banned.contains(&user_id) || ctx.is_exempt(&self.keywords, user_id)
            {
                continue;
            }
            self.store
                .upsert_activity(user_id, ctx.chat_id, None)
                .await?;
        }
        Ok(())
    }

    async fn enforce_obligation(
        &self,
        ctx: &SweepContext,
        diff: &MembershipDiff,
        report: &mut SweepReport,
    ) {
        if ctx.config.obligation_chat_id.is_none() {
            return;
        }
        let chat_id = ctx.chat_id;
        let newcomers: Vec<i64> = diff.newly_seen.iter().copied().collect();
        let due = self.enforcer.take_due_rechecks(chat_id).await;

        let mut outcomes = self.enforcer.enforce_many(chat_id, newcomers, true).await;
        outcomes.extend(self.enforcer.enforce_many(chat_id, due, false).await);
        report.obligation_removed = outcomes
            .into_iter()
            .filter(|(_, outcome)| *outcome == ObligationOutcome::Removed)
            .map(|(id, _)| id)
            .collect();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let text: Box<dyn Any + Send> = Box::new("static text");
        assert_eq!(panic_message(text.as_ref()), "static text");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_unknown_admin_set_treats_everyone_as_exempt() {
        let ctx = SweepContext {
            chat_id: -1,
            config: ChatConfig::new(-1),
            now: Utc::now(),
            handles: HashMap::new(),
            observed: HashMap::new(),
            exempt: None,
        };
        assert!(ctx.is_exempt(&ExemptKeywords::default(), 42));

        let ctx = SweepContext {
            exempt: Some(ExemptView {
                admins: Arc::new(HashSet::from([1])),
                whitelist: HashSet::from([2]),
            }),
            handles: HashMap::from([(3, Some("vip_3".to_string()))]),
            ..ctx
        };
        let keywords = ExemptKeywords::new(["vip"]);
        assert!(ctx.is_exempt(&keywords, 1));
        assert!(ctx.is_exempt(&keywords, 2));
        assert!(ctx.is_exempt(&keywords, 3));
        assert!(!ctx.is_exempt(&keywords, 4));
    }
}
