//! Real-time event handling.
//!
//! Applies single membership changes and messages as they arrive. Bans are
//! not applied here; the next sweep reconciles them.

use crate::admin_cache::AdminCache;
use crate::config::EngineTuning;
use crate::coordination::Coordinator;
use crate::diagnostics::OperatorReporter;
use crate::error::ModerationError;
use crate::exemption::ExemptionPolicy;
use crate::executor::ModerationExecutor;
use crate::gateway::ChatGateway;
use crate::model::{ChatConfig, ChatConfigUpdate, ParticipantKind, Transition, UserProfile};
use crate::obligation::{ObligationEnforcer, ObligationOutcome};
use crate::retry::RetryPolicy;
use crate::storage::MembershipStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A participant changed state in a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    /// Chat id.
    pub chat_id: i64,
    /// Chat title if known.
    pub chat_title: Option<String>,
    /// The affected user.
    pub user: UserProfile,
    /// Who caused the change, if reported.
    pub actor_id: Option<i64>,
    /// Kind before the change.
    pub old: ParticipantKind,
    /// Kind after the change.
    pub new: ParticipantKind,
    /// Event time.
    pub at: DateTime<Utc>,
}

/// A message was posted in a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Chat id.
    pub chat_id: i64,
    /// Chat title if known.
    pub chat_title: Option<String>,
    /// Sender.
    pub user: UserProfile,
    /// Carries a photo, video or document.
    pub has_qualifying_media: bool,
    /// Post time.
    pub at: DateTime<Utc>,
}

/// What the handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Nothing changed.
    Ignored,
    /// Only the admin set changed.
    AdminChanged,
    /// Join recorded.
    Joined {
        /// Obligation check result for gated chats.
        obligation: Option<ObligationOutcome>,
    },
    /// Leave recorded.
    Left {
        /// Ban-leavers fired.
        banned: bool,
    },
    /// Left for the next sweep to reconcile.
    Deferred,
    /// Sender registered, no qualifying media.
    Registered,
    /// Qualifying post recorded.
    ActivityRecorded,
}

/// Incremental updater reacting to individual events.
pub struct EventHandler {
    store: Arc<dyn MembershipStore>,
    admin_cache: Arc<AdminCache>,
    coordinator: Arc<Coordinator>,
    exemptions: Arc<ExemptionPolicy>,
    executor: Arc<ModerationExecutor>,
    enforcer: Arc<ObligationEnforcer>,
    freshness_window: Duration,
}

/// Components shared between the event handler and the sweeper.
#[derive(Clone)]
pub struct EngineParts {
    /// Platform queries and actions.
    pub gateway: Arc<dyn ChatGateway>,
    /// Persistence.
    pub store: Arc<dyn MembershipStore>,
    /// Admin sets.
    pub admin_cache: Arc<AdminCache>,
    /// Flags and hall passes.
    pub coordinator: Arc<Coordinator>,
    /// Exemption rules.
    pub exemptions: Arc<ExemptionPolicy>,
    /// Removal runner.
    pub executor: Arc<ModerationExecutor>,
    /// Obligation gate.
    pub enforcer: Arc<ObligationEnforcer>,
    /// Operator diagnostics.
    pub reporter: Arc<OperatorReporter>,
    /// Retry for platform calls.
    pub retry: RetryPolicy,
}

impl EventHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(parts: EngineParts, tuning: &EngineTuning) -> Self {
        Self {
            store: parts.store,
            admin_cache: parts.admin_cache,
            coordinator: parts.coordinator,
            exemptions: parts.exemptions,
            executor: parts.executor,
            enforcer: parts.enforcer,
            freshness_window: tuning.freshness_window,
        }
    }

    /// Apply a membership change.
    ///
    /// # Errors
    ///
    /// Storage errors. Failures of the ban-leavers action are logged, not returned.
    pub async fn handle_member_event(
        &self,
        event: MemberEvent,
    ) -> Result<EventOutcome, ModerationError> {
        let chat_id = event.chat_id;
        let user_id = event.user.user_id;
        let config = self.ensure_tracked(chat_id, event.chat_title.clone()).await?;

        let promoted = event.new.is_privileged() && !event.old.is_privileged();
        let demoted = event.old.is_privileged() && !event.new.is_privileged();
        if promoted {
            self.admin_cache.note_promoted(chat_id, user_id).await;
        } else if demoted {
            self.admin_cache.note_demoted(chat_id, user_id).await;
        }

        let was_present = event.old.is_present();
        let is_present = event.new.is_present();
        match (was_present, is_present) {
            (true, true) if promoted || demoted => {
                self.record_presence(&event).await?;
                Ok(EventOutcome::AdminChanged)
            }
            (false, true) => self.on_join(&event).await,
            (true, false) if event.new == ParticipantKind::Banned => {
                // A kick done as ban plus unban never surfaces as a plain leave
                if self.coordinator.take_hall_pass(chat_id, user_id).await {
                    debug!(chat_id, user_id, "Hall pass consumed by ban of a removal");
                } else {
                    debug!(chat_id, user_id, "Ban observed, deferring to next sweep");
                }
                Ok(EventOutcome::Deferred)
            }
            (true, false) => self.on_leave(&event, &config).await,
            _ => Ok(EventOutcome::Ignored),
        }
    }

    async fn record_presence(&self, event: &MemberEvent) -> Result<(), ModerationError> {
        let user_id = event.user.user_id;
        let previous = self
            .store
            .get_member(user_id, event.chat_id)
            .await?
            .map(|r| r.status);
        let transition = Transition::Joined {
            profile: event.user.clone(),
            status: event.new.classify(previous),
            joined_at: Some(event.at),
            observed_at: event.at,
        };
        self.store
            .upsert_member(event.chat_id, user_id, transition)
            .await?;
        Ok(())
    }

    async fn on_join(&self, event: &MemberEvent) -> Result<EventOutcome, ModerationError> {
        let chat_id = event.chat_id;
        let user_id = event.user.user_id;
        self.record_presence(event).await?;
        info!(chat_id, user_id, "User joined");

        if event.new.is_privileged()
            || self
                .exemptions
                .is_exempt(chat_id, user_id, event.user.handle.as_deref())
                .await
        {
            return Ok(EventOutcome::Joined { obligation: None });
        }
        self.store.upsert_activity(user_id, chat_id, None).await?;

        let obligation = match self.enforcer.enforce(chat_id, user_id).await {
            Ok(ObligationOutcome::NoObligation) => None,
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(chat_id, user_id, error = %e, "Obligation enforcement failed");
                Some(ObligationOutcome::Inconclusive)
            }
        };
        Ok(EventOutcome::Joined { obligation })
    }

    async fn on_leave(
        &self,
        event: &MemberEvent,
        config: &ChatConfig,
    ) -> Result<EventOutcome, ModerationError> {
        let chat_id = event.chat_id;
        let user_id = event.user.user_id;
        self.store
            .upsert_member(
                chat_id,
                user_id,
                Transition::Left {
                    at: event.at,
                    account_gone: false,
                },
            )
            .await?;
        self.store.delete_activity(user_id, chat_id).await?;
        info!(chat_id, user_id, "User left");

        if self.coordinator.take_hall_pass(chat_id, user_id).await {
            debug!(chat_id, user_id, "Hall pass consumed");
            return Ok(EventOutcome::Left { banned: false });
        }
        if !config.ban_leavers_mode {
            return Ok(EventOutcome::Left { banned: false });
        }
        let voluntary = event.actor_id.is_none_or(|actor| actor == user_id);
        if !voluntary || self.coordinator.purge_in_progress() {
            return Ok(EventOutcome::Left { banned: false });
        }
        if !config.is_fresh(Utc::now(), self.freshness_window) {
            warn!(chat_id, user_id, "Last sweep too old, ban-leavers suspended");
            return Ok(EventOutcome::Left { banned: false });
        }
        if self
            .exemptions
            .is_exempt(chat_id, user_id, event.user.handle.as_deref())
            .await
        {
            return Ok(EventOutcome::Left { banned: false });
        }

        match self.executor.ban_user(chat_id, user_id).await {
            Ok(()) => Ok(EventOutcome::Left { banned: true }),
            Err(e) => {
                warn!(chat_id, user_id, error = %e, "Ban-leavers action failed");
                Ok(EventOutcome::Left { banned: false })
            }
        }
    }

    /// Register a message sender and record qualifying activity.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn handle_message(
        &self,
        event: MessageEvent,
    ) -> Result<EventOutcome, ModerationError> {
        let chat_id = event.chat_id;
        let user_id = event.user.user_id;
        self.ensure_tracked(chat_id, event.chat_title.clone()).await?;

        let existing = self.store.get_member(user_id, chat_id).await?;
        if existing.as_ref().is_none_or(|r| !r.status.is_active()) {
            let previous = existing.map(|r| r.status);
            let transition = Transition::Joined {
                profile: event.user.clone(),
                status: ParticipantKind::Member.classify(previous),
                joined_at: None,
                observed_at: event.at,
            };
            self.store.upsert_member(chat_id, user_id, transition).await?;
        }

        if !event.has_qualifying_media {
            return Ok(EventOutcome::Registered);
        }
        let is_admin = match self.admin_cache.is_admin(chat_id, user_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                warn!(chat_id, user_id, error = %e, "Admin lookup failed, recording activity anyway");
                false
            }
        };
        if is_admin {
            return Ok(EventOutcome::Registered);
        }
        self.store
            .upsert_member(chat_id, user_id, Transition::Posted { at: event.at })
            .await?;
        self.store
            .upsert_activity(user_id, chat_id, Some(event.at))
            .await?;
        debug!(chat_id, user_id, "Qualifying post recorded");
        Ok(EventOutcome::ActivityRecorded)
    }

    async fn ensure_tracked(
        &self,
        chat_id: i64,
        title: Option<String>,
    ) -> Result<ChatConfig, ModerationError> {
        match self.store.get_chat_config(chat_id).await? {
            Some(config) if title.is_none() || config.title == title => Ok(config),
            _ => {
                let config = self
                    .store
                    .update_chat_config(chat_id, ChatConfigUpdate::Track { title })
                    .await?;
                Ok(config)
            }
        }
    }
}
