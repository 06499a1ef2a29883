//! Command facade.
//!
//! [`Moderator`] owns every engine component and exposes the structured
//! operations transports call. It never renders text.

use crate::admin_cache::AdminCache;
use crate::config::{EngineTuning, ModerationSettings, OBLIGATION_HISTORY_TTL_SECS};
use crate::coordination::Coordinator;
use crate::diagnostics::OperatorReporter;
use crate::error::ModerationError;
use crate::events::{EngineParts, EventHandler};
use crate::exemption::{ExemptKeywords, ExemptionPolicy};
use crate::executor::{ModerationExecutor, PurgeMode, PurgeReport, PurgeRequest};
use crate::gateway::ChatGateway;
use crate::model::{ChatConfig, ChatConfigUpdate, CounterKind, EscalationRecord, MemberRecord, Status, StatusFilter};
use crate::obligation::{EnforcerDeps, ObligationEnforcer, ObligationSettings};
use crate::retry::RetryPolicy;
use crate::storage::MembershipStore;
use crate::sweeper::{SweepOutcome, Sweeper};
use crate::utils::{instant_before, is_within, parse_cutoff, Cutoff};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Whitelisted users of one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistEntry {
    /// Chat id.
    pub chat_id: i64,
    /// Chat title or id.
    pub chat_name: String,
    /// `(user_id, name)` pairs sorted by id.
    pub users: Vec<(i64, String)>,
}

/// Everything known about one user in one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLookup {
    /// Queried user.
    pub user_id: i64,
    /// Queried chat.
    pub chat_id: i64,
    /// Membership record, if any.
    pub record: Option<MemberRecord>,
    /// Whether activity is tracked.
    pub activity_tracked: bool,
    /// Last qualifying post.
    pub last_posted: Option<DateTime<Utc>>,
    /// Inactivity kicks.
    pub kicks: EscalationRecord,
    /// Bans.
    pub bans: EscalationRecord,
    /// On the chat's whitelist.
    pub whitelisted: bool,
    /// Status in every other chat the user was seen in.
    pub other_chats: Vec<(i64, Status)>,
}

/// Aggregate statistics of one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStats {
    /// Chat configuration.
    pub config: ChatConfig,
    /// Normalized window label.
    pub window: String,
    /// Active members.
    pub members: usize,
    /// Admins and creators among them.
    pub admins: usize,
    /// Members with a qualifying post inside the window.
    pub posted_within: usize,
    /// Tracked members who never posted.
    pub never_posted: usize,
    /// Joins inside the window.
    pub joined_within: usize,
    /// Leaves inside the window.
    pub left_within: usize,
    /// Kicks inside the window.
    pub kicked_within: usize,
    /// Bans inside the window.
    pub banned_within: usize,
    /// Whitelisted users.
    pub whitelisted: usize,
}

/// Structured moderation API shared by every transport.
pub struct Moderator {
    store: Arc<dyn MembershipStore>,
    gateway: Arc<dyn ChatGateway>,
    admin_cache: Arc<AdminCache>,
    executor: Arc<ModerationExecutor>,
    events: Arc<EventHandler>,
    sweeper: Arc<Sweeper>,
    retry: RetryPolicy,
    tuning: EngineTuning,
}

impl Moderator {
    /// Wire every engine component around a gateway and a store.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<dyn MembershipStore>,
        settings: &ModerationSettings,
        tuning: EngineTuning,
    ) -> Self {
        let retry = RetryPolicy::from_tuning(&tuning);
        let coordinator = Arc::new(Coordinator::new(tuning.hall_pass_ttl, tuning.drain_poll));
        let admin_cache = Arc::new(AdminCache::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            retry,
            tuning.admin_cache_ttl,
        ));
        let keywords = ExemptKeywords::new(settings.exempt_keywords());
        let exemptions = Arc::new(ExemptionPolicy::new(
            keywords.clone(),
            Arc::clone(&admin_cache),
            Arc::clone(&store),
        ));
        let executor = Arc::new(ModerationExecutor::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&admin_cache),
            keywords,
            retry,
            tuning.num_batches,
        ));
        let enforcer = Arc::new(ObligationEnforcer::new(
            EnforcerDeps {
                store: Arc::clone(&store),
                gateway: Arc::clone(&gateway),
                executor: Arc::clone(&executor),
                coordinator: Arc::clone(&coordinator),
                exemptions: Arc::clone(&exemptions),
                retry,
            },
            ObligationSettings {
                freshness_window: tuning.freshness_window,
                grace: tuning.obligation_grace,
                notice_template: settings.obligation_notice(),
                history_ttl: Duration::from_secs(OBLIGATION_HISTORY_TTL_SECS)
                    .max(tuning.obligation_grace),
            },
        ));
        let parts = EngineParts {
            gateway: Arc::clone(&gateway),
            store: Arc::clone(&store),
            admin_cache: Arc::clone(&admin_cache),
            coordinator,
            exemptions,
            executor: Arc::clone(&executor),
            enforcer,
            reporter: Arc::new(OperatorReporter::new(
                Arc::clone(&gateway),
                settings.operator_chat_id,
            )),
            retry,
        };

        Self {
            events: Arc::new(EventHandler::new(parts.clone(), &tuning)),
            sweeper: Arc::new(Sweeper::new(parts, &tuning)),
            store,
            gateway,
            admin_cache,
            executor,
            retry,
            tuning,
        }
    }

    /// Real-time event handler.
    #[must_use]
    pub fn event_handler(&self) -> Arc<EventHandler> {
        Arc::clone(&self.events)
    }

    /// Reconciliation sweeper, for the scheduler.
    #[must_use]
    pub fn sweeper(&self) -> Arc<Sweeper> {
        Arc::clone(&self.sweeper)
    }

    /// Resolved tunables.
    #[must_use]
    pub const fn tuning(&self) -> &EngineTuning {
        &self.tuning
    }

    /// Purge users inactive for longer than `cutoff` (e.g. `3d`).
    ///
    /// # Errors
    ///
    /// `InvalidCutoff`, `PurgeInProgress`, `ChatNotTracked`, or the gateway or
    /// storage error that prevented selection.
    pub async fn run_purge(
        &self,
        chat_id: i64,
        cutoff: &str,
        mode: PurgeMode,
        pretend: bool,
    ) -> Result<(Cutoff, PurgeReport), ModerationError> {
        let cutoff = parse_cutoff(cutoff)?;
        let report = self
            .executor
            .run_purge(PurgeRequest {
                chat_id,
                cutoff: cutoff.span,
                mode,
                pretend,
            })
            .await?;
        Ok((cutoff, report))
    }

    /// Flip three-strikes mode; returns the new value.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn toggle_three_strikes(&self, chat_id: i64) -> Result<bool, ModerationError> {
        let config = self
            .store
            .update_chat_config(chat_id, ChatConfigUpdate::ToggleThreeStrikes)
            .await?;
        info!(chat_id, enabled = config.three_strikes_mode, "Three strikes toggled");
        Ok(config.three_strikes_mode)
    }

    /// Flip ban-leavers mode; returns the new value.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn toggle_ban_leavers(&self, chat_id: i64) -> Result<bool, ModerationError> {
        let config = self
            .store
            .update_chat_config(chat_id, ChatConfigUpdate::ToggleBanLeavers)
            .await?;
        info!(chat_id, enabled = config.ban_leavers_mode, "Ban leavers toggled");
        Ok(config.ban_leavers_mode)
    }

    /// Require members of `chat_id` to also be in `target`, or clear the requirement.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when a chat would oblige itself, `ChatNotTracked`
    /// when the target is unknown, storage errors.
    pub async fn set_obligation(
        &self,
        chat_id: i64,
        target: Option<i64>,
    ) -> Result<ChatConfig, ModerationError> {
        if let Some(target) = target {
            if target == chat_id {
                return Err(ModerationError::InvalidArgument(
                    "a chat cannot be its own obligation chat".into(),
                ));
            }
            if self.store.get_chat_config(target).await?.is_none() {
                return Err(ModerationError::ChatNotTracked(target));
            }
        }
        let config = self
            .store
            .update_chat_config(chat_id, ChatConfigUpdate::SetObligation(target))
            .await?;
        info!(chat_id, obligation = ?target, "Obligation chat set");
        Ok(config)
    }

    /// Sweep every tracked chat now.
    pub async fn run_sweep_now(&self) -> Vec<(i64, SweepOutcome)> {
        self.sweeper.sweep_all().await
    }

    /// Whitelist a user; `true` if newly added.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn add_whitelist(&self, chat_id: i64, user_id: i64) -> Result<bool, ModerationError> {
        Ok(self.store.add_whitelist(user_id, chat_id).await?)
    }

    /// Remove a user from the whitelist; `true` if they were on it.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn remove_whitelist(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<bool, ModerationError> {
        Ok(self.store.remove_whitelist(user_id, chat_id).await?)
    }

    /// Whitelist of one chat, or of every tracked chat.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn whitelist(
        &self,
        chat_id: Option<i64>,
    ) -> Result<Vec<WhitelistEntry>, ModerationError> {
        let chat_ids = match chat_id {
            Some(id) => vec![id],
            None => self.store.list_chat_ids().await?,
        };
        let mut entries = Vec::new();
        for chat_id in chat_ids {
            let ids = self.store.list_whitelist(chat_id).await?;
            if ids.is_empty() {
                continue;
            }
            let chat_name = self
                .store
                .get_chat_config(chat_id)
                .await?
                .map_or_else(|| chat_id.to_string(), |c| c.display_name());
            let mut users = Vec::with_capacity(ids.len());
            for user_id in ids {
                let name = self
                    .store
                    .get_member(user_id, chat_id)
                    .await?
                    .map_or_else(|| user_id.to_string(), |r| r.profile().mention());
                users.push((user_id, name));
            }
            users.sort_unstable_by_key(|(id, _)| *id);
            entries.push(WhitelistEntry {
                chat_id,
                chat_name,
                users,
            });
        }
        Ok(entries)
    }

    /// Everything stored about a user.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn lookup_user(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<UserLookup, ModerationError> {
        let record = self.store.get_member(user_id, chat_id).await?;
        let activity = self.store.list_activity(chat_id).await?;
        let tracked = activity.get(&user_id);
        let mut other_chats: Vec<(i64, Status)> = self
            .store
            .list_user_memberships(user_id)
            .await?
            .into_iter()
            .filter(|r| r.chat_id != chat_id)
            .map(|r| (r.chat_id, r.status))
            .collect();
        other_chats.sort_unstable_by_key(|(id, _)| *id);

        Ok(UserLookup {
            user_id,
            chat_id,
            last_posted: tracked
                .and_then(|a| a.last_posted)
                .or_else(|| record.as_ref().and_then(|r| r.last_posted)),
            activity_tracked: tracked.is_some(),
            record,
            kicks: self.store.get_counter(user_id, chat_id, CounterKind::Kick).await?,
            bans: self.store.get_counter(user_id, chat_id, CounterKind::Ban).await?,
            whitelisted: self.store.list_whitelist(chat_id).await?.contains(&user_id),
            other_chats,
        })
    }

    /// Membership and activity statistics over a window such as `7d`.
    ///
    /// # Errors
    ///
    /// `InvalidCutoff`, `ChatNotTracked`, storage errors.
    pub async fn chat_stats(&self, chat_id: i64, window: &str) -> Result<ChatStats, ModerationError> {
        let window = parse_cutoff(window)?;
        let config = self
            .store
            .get_chat_config(chat_id)
            .await?
            .ok_or(ModerationError::ChatNotTracked(chat_id))?;
        let records = self.store.list_members(chat_id, StatusFilter::Any).await?;
        let activity = self.store.list_activity(chat_id).await?;
        let now = Utc::now();
        let since = instant_before(now, window.span);
        let within = |at: Option<DateTime<Utc>>| is_within(at, now, window.span);

        let active: Vec<&MemberRecord> = records.iter().filter(|r| r.status.is_active()).collect();
        Ok(ChatStats {
            members: active.len(),
            admins: active.iter().filter(|r| r.status.is_privileged()).count(),
            posted_within: activity
                .values()
                .filter(|a| a.last_posted.is_some_and(|at| at >= since))
                .count(),
            never_posted: activity.values().filter(|a| a.last_posted.is_none()).count(),
            joined_within: records.iter().filter(|r| within(r.last_joined)).count(),
            left_within: records.iter().filter(|r| within(r.last_left)).count(),
            kicked_within: records.iter().filter(|r| within(r.last_kicked)).count(),
            banned_within: records.iter().filter(|r| within(r.last_banned)).count(),
            whitelisted: self.store.list_whitelist(chat_id).await?.len(),
            window: window.label,
            config,
        })
    }

    /// Untrack every chat the bot can no longer reach; returns their ids.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn clean_inactive_chats(&self) -> Result<Vec<i64>, ModerationError> {
        let mut removed = Vec::new();
        for chat_id in self.store.list_chat_ids().await? {
            match self
                .retry
                .run("chat_info", || self.gateway.chat_info(chat_id))
                .await
            {
                Ok(info) => {
                    if info.title.is_some() {
                        self.store
                            .update_chat_config(chat_id, ChatConfigUpdate::Track { title: info.title })
                            .await?;
                    }
                }
                Err(e) if e.is_chat_loss() => {
                    self.store.delete_chat(chat_id).await?;
                    self.admin_cache.invalidate(chat_id).await;
                    info!(chat_id, "Inaccessible chat removed");
                    removed.push(chat_id);
                }
                Err(e) => warn!(chat_id, error = %e, "Chat check inconclusive, keeping it"),
            }
        }
        Ok(removed)
    }

    /// Resolve `@handle`, a bare handle or a numeric id to a user id.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when nothing matches, storage errors.
    pub async fn resolve_user(&self, chat_id: i64, token: &str) -> Result<i64, ModerationError> {
        let token = token.trim();
        if let Ok(user_id) = token.parse::<i64>() {
            return Ok(user_id);
        }
        let handle = token.trim_start_matches('@');
        if handle.is_empty() {
            return Err(ModerationError::InvalidArgument("expected @username or user id".into()));
        }
        self.store
            .find_member_by_handle(chat_id, handle.to_string())
            .await?
            .map(|r| r.user_id)
            .ok_or_else(|| ModerationError::InvalidArgument(format!("unknown user {token}")))
    }

    /// Start tracking a chat, or refresh its title.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn track_chat(
        &self,
        chat_id: i64,
        title: Option<String>,
    ) -> Result<ChatConfig, ModerationError> {
        Ok(self
            .store
            .update_chat_config(chat_id, ChatConfigUpdate::Track { title })
            .await?)
    }

    /// Whether the user administers the chat. Lookup failures count as no.
    pub async fn is_chat_admin(&self, chat_id: i64, user_id: i64) -> bool {
        match self.admin_cache.is_admin(chat_id, user_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                warn!(chat_id, user_id, error = %e, "Admin lookup failed");
                false
            }
        }
    }

    /// Allowed when no authorized admins are configured, or one of them administers the chat.
    pub async fn is_chat_authorized(&self, chat_id: i64, authorized: &HashSet<i64>) -> bool {
        if authorized.is_empty() {
            return true;
        }
        match self.admin_cache.admins(chat_id).await {
            Ok(admins) => !admins.is_disjoint(authorized),
            Err(e) => {
                warn!(chat_id, error = %e, "Admin lookup failed, chat not authorized");
                false
            }
        }
    }
}
