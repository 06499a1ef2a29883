//! Cross-chat membership obligations.
//!
//! A chat may require its members to also belong to an obligation chat. New
//! joiners missing from it get a notice and are removed, with a hall pass so
//! the resulting leave does not trigger ban-leavers.

use crate::coordination::Coordinator;
use crate::error::ModerationError;
use crate::exemption::ExemptionPolicy;
use crate::executor::ModerationExecutor;
use crate::gateway::{ChatGateway, GatewayError};
use crate::retry::RetryPolicy;
use crate::storage::MembershipStore;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the enforcer did for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationOutcome {
    /// The chat has no obligation.
    NoObligation,
    /// The chat's last sweep is too old to act on.
    Stale,
    /// The user is exempt.
    Exempt,
    /// The user is not (or no longer) in the chat.
    NotPresent,
    /// The user belongs to the obligation chat.
    Satisfied,
    /// Membership could not be confirmed either way.
    Inconclusive,
    /// Re-check postponed until the grace window closes.
    Deferred {
        /// When the re-check becomes due.
        until: DateTime<Utc>,
    },
    /// The user was removed.
    Removed,
}

/// Enforcer settings.
#[derive(Debug, Clone)]
pub struct ObligationSettings {
    /// Maximum age of the last sweep for enforcement to act.
    pub freshness_window: Duration,
    /// Grace window for users removed before; zero disables it.
    pub grace: Duration,
    /// Notice template with `{user}` and `{chat}` placeholders.
    pub notice_template: String,
    /// How long removals are remembered.
    pub history_ttl: Duration,
}

/// Cross-chat membership gate.
pub struct ObligationEnforcer {
    store: Arc<dyn MembershipStore>,
    gateway: Arc<dyn ChatGateway>,
    executor: Arc<ModerationExecutor>,
    coordinator: Arc<Coordinator>,
    exemptions: Arc<ExemptionPolicy>,
    retry: RetryPolicy,
    settings: ObligationSettings,
    removals: Cache<(i64, i64), DateTime<Utc>>,
    pending: Cache<(i64, i64), DateTime<Utc>>,
}

/// Shared handles the enforcer needs.
pub struct EnforcerDeps {
    /// Persistence.
    pub store: Arc<dyn MembershipStore>,
    /// Platform.
    pub gateway: Arc<dyn ChatGateway>,
    /// Removal runner.
    pub executor: Arc<ModerationExecutor>,
    /// Hall passes.
    pub coordinator: Arc<Coordinator>,
    /// Exemption rules.
    pub exemptions: Arc<ExemptionPolicy>,
    /// Retry for point lookups.
    pub retry: RetryPolicy,
}

impl ObligationEnforcer {
    /// Create the enforcer.
    #[must_use]
    pub fn new(deps: EnforcerDeps, settings: ObligationSettings) -> Self {
        let history = |ttl: Duration| {
            Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl.max(Duration::from_secs(1)))
                .build()
        };
        Self {
            removals: history(settings.history_ttl),
            pending: history(settings.history_ttl),
            store: deps.store,
            gateway: deps.gateway,
            executor: deps.executor,
            coordinator: deps.coordinator,
            exemptions: deps.exemptions,
            retry: deps.retry,
            settings,
        }
    }

    /// Enforce the obligation for a newly joined user.
    ///
    /// # Errors
    ///
    /// Storage errors, and gateway errors from the removal itself.
    pub async fn enforce(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<ObligationOutcome, ModerationError> {
        self.enforce_inner(chat_id, user_id, true).await
    }

    /// Enforce for several users, logging per-user failures.
    pub async fn enforce_many(
        &self,
        chat_id: i64,
        user_ids: Vec<i64>,
        grace_applies: bool,
    ) -> Vec<(i64, ObligationOutcome)> {
        let mut outcomes = Vec::new();
        for user_id in user_ids {
            match self.enforce_inner(chat_id, user_id, grace_applies).await {
                Ok(outcome) => outcomes.push((user_id, outcome)),
                Err(e) => warn!(chat_id, user_id, error = %e, "Obligation check failed"),
            }
        }
        outcomes
    }

    /// Users of a chat whose grace window closed; they are removed from the pending set.
    pub async fn take_due_rechecks(&self, chat_id: i64) -> Vec<i64> {
        let now = Utc::now();
        let due: Vec<(i64, i64)> = self
            .pending
            .iter()
            .filter(|(key, until)| key.0 == chat_id && *until <= now)
            .map(|(key, _)| *key)
            .collect();
        let mut users = Vec::with_capacity(due.len());
        for key in due {
            if self.pending.remove(&key).await.is_some() {
                users.push(key.1);
            }
        }
        users.sort_unstable();
        users
    }

    async fn enforce_inner(
        &self,
        chat_id: i64,
        user_id: i64,
        grace_applies: bool,
    ) -> Result<ObligationOutcome, ModerationError> {
        let Some(config) = self.store.get_chat_config(chat_id).await? else {
            return Ok(ObligationOutcome::NoObligation);
        };
        let Some(obligation_chat) = config.obligation_chat_id.filter(|id| *id != chat_id) else {
            return Ok(ObligationOutcome::NoObligation);
        };
        let now = Utc::now();
        if !config.is_fresh(now, self.settings.freshness_window) {
            debug!(chat_id, user_id, "Last sweep too old, obligation not enforced");
            return Ok(ObligationOutcome::Stale);
        }

        let record = self.store.get_member(user_id, chat_id).await?;
        if record.as_ref().is_some_and(|r| !r.status.is_active()) {
            return Ok(ObligationOutcome::NotPresent);
        }
        let handle = record.as_ref().and_then(|r| r.handle.clone());
        if self
            .exemptions
            .is_exempt(chat_id, user_id, handle.as_deref())
            .await
        {
            return Ok(ObligationOutcome::Exempt);
        }

        if grace_applies && !self.settings.grace.is_zero() {
            if let Some(removed_at) = self.removals.get(&(chat_id, user_id)).await {
                debug!(chat_id, user_id, %removed_at, "Previously removed, granting grace window");
                let until = now
                    + chrono::Duration::from_std(self.settings.grace)
                        .unwrap_or(chrono::Duration::zero());
                self.pending.insert((chat_id, user_id), until).await;
                return Ok(ObligationOutcome::Deferred { until });
            }
        }

        match self.is_member_of(obligation_chat, user_id).await {
            Some(true) => return Ok(ObligationOutcome::Satisfied),
            Some(false) => {}
            None => return Ok(ObligationOutcome::Inconclusive),
        }

        self.remove(chat_id, obligation_chat, user_id, record.map(|r| r.profile().mention()))
            .await?;
        Ok(ObligationOutcome::Removed)
    }

    /// Local record first, then an authoritative point query. `None` when unsure.
    async fn is_member_of(&self, obligation_chat: i64, user_id: i64) -> Option<bool> {
        match self.store.get_member(user_id, obligation_chat).await {
            Ok(Some(record)) if record.status.is_active() => return Some(true),
            Ok(_) => {}
            Err(e) => warn!(obligation_chat, user_id, error = %e, "Local obligation lookup failed"),
        }
        let lookup = self
            .retry
            .run("get_member", || self.gateway.get_member(obligation_chat, user_id))
            .await;
        match lookup {
            Ok(participant) => Some(participant.kind.is_present()),
            Err(GatewayError::MemberNotFound(_)) => Some(false),
            Err(e) => {
                warn!(obligation_chat, user_id, error = %e, "Obligation membership inconclusive");
                None
            }
        }
    }

    async fn remove(
        &self,
        chat_id: i64,
        obligation_chat: i64,
        user_id: i64,
        mention: Option<String>,
    ) -> Result<(), ModerationError> {
        self.coordinator.grant_hall_pass(chat_id, user_id).await;

        let obligation_name = match self.store.get_chat_config(obligation_chat).await {
            Ok(Some(config)) => config.display_name(),
            _ => obligation_chat.to_string(),
        };
        let notice = self
            .settings
            .notice_template
            .replace("{user}", &mention.unwrap_or_else(|| user_id.to_string()))
            .replace("{chat}", &obligation_name);
        if let Err(e) = self.gateway.send_message(chat_id, notice).await {
            warn!(chat_id, user_id, error = %e, "Obligation notice not delivered");
        }

        let kind = self.executor.rejoinable_removal(chat_id);
        if let Err(e) = self.executor.remove_user(chat_id, user_id, kind).await {
            self.coordinator.take_hall_pass(chat_id, user_id).await;
            return Err(e);
        }
        self.removals.insert((chat_id, user_id), Utc::now()).await;
        info!(chat_id, obligation_chat, user_id, "User removed for missing obligation chat");
        Ok(())
    }
}
