//! Membership data model
//!
//! Records persisted per (user, chat) and per chat. Every member mutation goes
//! through [`Transition`] and every chat configuration mutation through
//! [`ChatConfigUpdate`], so the sweeper and the event handler share one code path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of a user inside a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Regular participant.
    Member,
    /// Chat administrator.
    Admin,
    /// Chat owner.
    Creator,
    /// Left on their own or after a kick was lifted.
    Left,
    /// Removed by the bot with the option to rejoin.
    Kicked,
    /// Banned from the chat.
    Banned,
    /// The account no longer resolves on the platform.
    NotAvailable,
}

impl Status {
    /// Whether the user currently counts as present in the chat.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Member | Self::Admin | Self::Creator)
    }

    /// Admin or creator.
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Admin | Self::Creator)
    }

    /// Short human readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Creator => "creator",
            Self::Left => "left",
            Self::Kicked => "kicked",
            Self::Banned => "banned",
            Self::NotAvailable => "not available",
        }
    }
}

/// Participant kind as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantKind {
    /// Chat owner.
    Creator,
    /// Administrator.
    Administrator,
    /// Plain member.
    Member,
    /// Restricted user; `is_member` tells whether they are still inside.
    Restricted {
        /// Still a participant despite restrictions.
        is_member: bool,
    },
    /// Not in the chat.
    Left,
    /// Banned.
    Banned,
    /// The platform returned a kind the engine does not understand.
    Unknown,
}

impl ParticipantKind {
    /// Whether this kind means the user is inside the chat.
    #[must_use]
    pub const fn is_present(self) -> bool {
        matches!(
            self,
            Self::Creator
                | Self::Administrator
                | Self::Member
                | Self::Restricted { is_member: true }
                | Self::Unknown
        )
    }

    /// Admin or owner.
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Creator | Self::Administrator)
    }

    /// Map to a persisted [`Status`].
    ///
    /// Restricted and unknown kinds are ambiguous: a previously held Admin or
    /// Creator status is kept instead of being downgraded to Member.
    #[must_use]
    pub fn classify(self, previous: Option<Status>) -> Status {
        let keep_privileged = |fallback: Status| match previous {
            Some(prev) if prev.is_privileged() => prev,
            _ => fallback,
        };
        match self {
            Self::Creator => Status::Creator,
            Self::Administrator => Status::Admin,
            Self::Member => Status::Member,
            Self::Restricted { is_member: true } | Self::Unknown => keep_privileged(Status::Member),
            Self::Restricted { is_member: false } | Self::Left => Status::Left,
            Self::Banned => Status::Banned,
        }
    }
}

/// Identity and flags of a platform account.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Platform user id.
    pub user_id: i64,
    /// Display name.
    pub display_name: String,
    /// Public handle without the leading `@`.
    pub handle: Option<String>,
    /// Premium subscriber.
    pub is_premium: bool,
    /// Verified account.
    pub is_verified: bool,
    /// Bot account.
    pub is_bot: bool,
    /// Flagged as impersonation.
    pub is_fake: bool,
    /// Flagged as scam.
    pub is_scam: bool,
    /// Restricted by the platform.
    pub is_restricted: bool,
    /// Platform restriction reason.
    pub restriction_reason: Option<String>,
}

impl UserProfile {
    /// Profile carrying only an id and a display name.
    #[must_use]
    pub fn new(user_id: i64, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Attach a handle.
    #[must_use]
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// `@handle` when known, the display name otherwise.
    #[must_use]
    pub fn mention(&self) -> String {
        match &self.handle {
            Some(handle) => format!("@{handle}"),
            None if self.display_name.is_empty() => self.user_id.to_string(),
            None => self.display_name.clone(),
        }
    }
}

/// A single observed change of a user's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Seen present in the chat.
    Joined {
        /// Latest known profile.
        profile: UserProfile,
        /// Classified status.
        status: Status,
        /// Join date reported by the platform, if any.
        joined_at: Option<DateTime<Utc>>,
        /// When the engine observed the presence.
        observed_at: DateTime<Utc>,
    },
    /// No longer in the chat.
    Left {
        /// Observation time.
        at: DateTime<Utc>,
        /// The account itself is gone.
        account_gone: bool,
    },
    /// Removed by the bot.
    Kicked {
        /// Action time.
        at: DateTime<Utc>,
    },
    /// Banned.
    Banned {
        /// Action or observation time.
        at: DateTime<Utc>,
    },
    /// Posted qualifying content.
    Posted {
        /// Post time.
        at: DateTime<Utc>,
    },
}

/// Persisted membership of one user in one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Platform user id.
    pub user_id: i64,
    /// Chat id.
    pub chat_id: i64,
    /// Display name.
    pub display_name: String,
    /// Handle without `@`.
    pub handle: Option<String>,
    /// Premium subscriber.
    pub is_premium: bool,
    /// Verified account.
    pub is_verified: bool,
    /// Bot account.
    pub is_bot: bool,
    /// Flagged as impersonation.
    pub is_fake: bool,
    /// Flagged as scam.
    pub is_scam: bool,
    /// Restricted by the platform.
    pub is_restricted: bool,
    /// Platform restriction reason.
    pub restriction_reason: Option<String>,
    /// Lifecycle status.
    pub status: Status,
    /// First time the user was seen in the chat. Never changes once set.
    pub first_joined: Option<DateTime<Utc>>,
    /// Latest join.
    pub last_joined: Option<DateTime<Utc>>,
    /// Latest leave.
    pub last_left: Option<DateTime<Utc>>,
    /// Latest kick.
    pub last_kicked: Option<DateTime<Utc>>,
    /// Latest ban.
    pub last_banned: Option<DateTime<Utc>>,
    /// Latest qualifying post.
    pub last_posted: Option<DateTime<Utc>>,
    /// Number of joins observed.
    pub times_joined: u32,
    /// Number of leaves observed.
    pub times_left: u32,
    /// Number of kicks.
    pub times_kicked: u32,
    /// Number of bans.
    pub times_banned: u32,
}

impl MemberRecord {
    /// Empty record for a user never seen before.
    #[must_use]
    pub fn new(user_id: i64, chat_id: i64) -> Self {
        Self {
            user_id,
            chat_id,
            display_name: String::new(),
            handle: None,
            is_premium: false,
            is_verified: false,
            is_bot: false,
            is_fake: false,
            is_scam: false,
            is_restricted: false,
            restriction_reason: None,
            status: Status::Left,
            first_joined: None,
            last_joined: None,
            last_left: None,
            last_kicked: None,
            last_banned: None,
            last_posted: None,
            times_joined: 0,
            times_left: 0,
            times_kicked: 0,
            times_banned: 0,
        }
    }

    /// Apply one transition.
    ///
    /// Joined/Left/Banned are idempotent: applying the same observation twice
    /// leaves the record unchanged. Kicked counts every call since each one is
    /// a distinct moderation action.
    pub fn apply(&mut self, transition: &Transition) {
        let was_active = self.status.is_active();
        match transition {
            Transition::Joined {
                profile,
                status,
                joined_at,
                observed_at,
            } => {
                self.apply_profile(profile);
                let join_time = joined_at.unwrap_or(*observed_at);
                if self.first_joined.is_none() {
                    self.first_joined = Some(join_time);
                }
                if joined_at.is_some() || !was_active || self.last_joined.is_none() {
                    self.last_joined = Some(join_time);
                }
                if !was_active {
                    self.times_joined += 1;
                }
                self.status = *status;
            }
            Transition::Left { at, account_gone } => {
                if was_active {
                    self.times_left += 1;
                    self.last_left = Some(*at);
                }
                self.status = if *account_gone {
                    Status::NotAvailable
                } else {
                    Status::Left
                };
            }
            Transition::Kicked { at } => {
                self.times_kicked += 1;
                self.last_kicked = Some(*at);
                self.status = Status::Kicked;
            }
            Transition::Banned { at } => {
                if self.status != Status::Banned {
                    self.times_banned += 1;
                    self.last_banned = Some(*at);
                }
                self.status = Status::Banned;
            }
            Transition::Posted { at } => {
                if self.last_posted.is_none_or(|last| *at > last) {
                    self.last_posted = Some(*at);
                }
            }
        }
    }

    fn apply_profile(&mut self, profile: &UserProfile) {
        if !profile.display_name.is_empty() {
            self.display_name.clone_from(&profile.display_name);
        }
        if profile.handle.is_some() {
            self.handle.clone_from(&profile.handle);
        }
        self.is_premium = profile.is_premium;
        self.is_verified = profile.is_verified;
        self.is_bot = profile.is_bot;
        self.is_fake = profile.is_fake;
        self.is_scam = profile.is_scam;
        self.is_restricted = profile.is_restricted;
        self.restriction_reason.clone_from(&profile.restriction_reason);
    }

    /// Profile view of the record.
    #[must_use]
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            handle: self.handle.clone(),
            is_premium: self.is_premium,
            is_verified: self.is_verified,
            is_bot: self.is_bot,
            is_fake: self.is_fake,
            is_scam: self.is_scam,
            is_restricted: self.is_restricted,
            restriction_reason: self.restriction_reason.clone(),
        }
    }
}

/// Last qualifying post of a tracked user. `None` means tracked but never posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Last qualifying post.
    pub last_posted: Option<DateTime<Utc>>,
}

impl ActivityRecord {
    /// Keep the newer of the stored and the given timestamp.
    pub fn touch(&mut self, posted_at: Option<DateTime<Utc>>) {
        if let Some(at) = posted_at {
            if self.last_posted.is_none_or(|last| at > last) {
                self.last_posted = Some(at);
            }
        }
    }
}

/// Which escalation counter to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKind {
    /// Inactivity kicks.
    Kick,
    /// Bans.
    Ban,
}

/// Escalation counter for repeat offenders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Number of actions taken.
    pub count: u32,
    /// Latest action.
    pub last_action_at: Option<DateTime<Utc>>,
    /// The user's last post at the time of the latest action.
    pub last_posted_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    /// Record one more action.
    pub fn increment(&mut self, at: DateTime<Utc>, last_posted: Option<DateTime<Utc>>) {
        self.count += 1;
        self.last_action_at = Some(at);
        self.last_posted_at = last_posted;
    }
}

/// Per-chat configuration. Its presence means the chat is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Chat id.
    pub chat_id: i64,
    /// Display name.
    pub title: Option<String>,
    /// Escalate to a ban after two inactivity kicks.
    pub three_strikes_mode: bool,
    /// Ban users as soon as they leave.
    pub ban_leavers_mode: bool,
    /// Chat whose membership is required to stay here.
    pub obligation_chat_id: Option<i64>,
    /// Completion time of the last sweep.
    pub last_sweep_at: Option<DateTime<Utc>>,
    /// Last admin list refresh.
    pub last_admin_refresh_at: Option<DateTime<Utc>>,
}

/// A single chat configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatConfigUpdate {
    /// Start tracking, optionally recording the title.
    Track {
        /// Title if known.
        title: Option<String>,
    },
    /// Flip three-strikes mode.
    ToggleThreeStrikes,
    /// Flip ban-leavers mode.
    ToggleBanLeavers,
    /// Set or clear the obligation chat.
    SetObligation(Option<i64>),
    /// A sweep completed.
    MarkSwept(DateTime<Utc>),
    /// The admin list was refreshed.
    MarkAdminRefresh(DateTime<Utc>),
}

impl ChatConfig {
    /// Fresh configuration with every policy off.
    #[must_use]
    pub const fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            title: None,
            three_strikes_mode: false,
            ban_leavers_mode: false,
            obligation_chat_id: None,
            last_sweep_at: None,
            last_admin_refresh_at: None,
        }
    }

    /// Apply one update.
    pub fn apply(&mut self, update: &ChatConfigUpdate) {
        match update {
            ChatConfigUpdate::Track { title } => {
                if title.is_some() {
                    self.title.clone_from(title);
                }
            }
            ChatConfigUpdate::ToggleThreeStrikes => {
                self.three_strikes_mode = !self.three_strikes_mode;
            }
            ChatConfigUpdate::ToggleBanLeavers => self.ban_leavers_mode = !self.ban_leavers_mode,
            ChatConfigUpdate::SetObligation(target) => self.obligation_chat_id = *target,
            ChatConfigUpdate::MarkSwept(at) => self.last_sweep_at = Some(*at),
            ChatConfigUpdate::MarkAdminRefresh(at) => self.last_admin_refresh_at = Some(*at),
        }
    }

    /// Whether the last sweep finished within `window` before `now`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        crate::utils::is_within(self.last_sweep_at, now, window)
    }

    /// Title or the numeric id.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| self.chat_id.to_string())
    }
}

/// Status selector for store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Every record.
    Any,
    /// Member, Admin or Creator.
    Active,
    /// Exactly this status.
    Only(Status),
}

impl StatusFilter {
    /// Whether `status` passes the filter.
    #[must_use]
    pub fn matches(self, status: Status) -> bool {
        match self {
            Self::Any => true,
            Self::Active => status.is_active(),
            Self::Only(expected) => status == expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .unwrap_or_default()
    }

    fn joined(status: Status, joined_at: Option<DateTime<Utc>>, observed: i64) -> Transition {
        Transition::Joined {
            profile: UserProfile::new(7, "Seven").with_handle("seven"),
            status,
            joined_at,
            observed_at: ts(observed),
        }
    }

    #[test]
    fn test_snapshot_applied_twice_is_idempotent() {
        let mut record = MemberRecord::new(7, 1);
        record.apply(&joined(Status::Member, None, 0));
        let once = record.clone();
        record.apply(&joined(Status::Member, None, 60));
        assert_eq!(record, once);
        assert_eq!(record.times_joined, 1);
        assert_eq!(record.handle.as_deref(), Some("seven"));
    }

    #[test]
    fn test_first_joined_never_regresses() {
        let mut record = MemberRecord::new(7, 1);
        record.apply(&joined(Status::Member, Some(ts(100)), 100));
        record.apply(&Transition::Left {
            at: ts(200),
            account_gone: false,
        });
        record.apply(&joined(Status::Member, Some(ts(10)), 300));
        assert_eq!(record.first_joined, Some(ts(100)));
        assert_eq!(record.last_joined, Some(ts(10)));
        assert_eq!(record.times_joined, 2);
        assert_eq!(record.times_left, 1);
    }

    #[test]
    fn test_rejoin_without_platform_date_uses_observation() {
        let mut record = MemberRecord::new(7, 1);
        record.apply(&joined(Status::Member, None, 0));
        record.apply(&Transition::Left {
            at: ts(50),
            account_gone: false,
        });
        record.apply(&joined(Status::Member, None, 90));
        assert_eq!(record.last_joined, Some(ts(90)));
        assert_eq!(record.first_joined, Some(ts(0)));
    }

    #[test]
    fn test_repeated_leave_and_ban_count_once() {
        let mut record = MemberRecord::new(7, 1);
        record.apply(&joined(Status::Member, None, 0));
        for _ in 0..2 {
            record.apply(&Transition::Left {
                at: ts(10),
                account_gone: false,
            });
        }
        assert_eq!(record.times_left, 1);
        for _ in 0..2 {
            record.apply(&Transition::Banned { at: ts(20) });
        }
        assert_eq!(record.times_banned, 1);
        assert_eq!(record.status, Status::Banned);
    }

    #[test]
    fn test_posted_keeps_newest() {
        let mut record = MemberRecord::new(7, 1);
        record.apply(&Transition::Posted { at: ts(50) });
        record.apply(&Transition::Posted { at: ts(10) });
        assert_eq!(record.last_posted, Some(ts(50)));
    }

    #[test]
    fn test_ambiguous_kind_keeps_privilege() {
        assert_eq!(
            ParticipantKind::Restricted { is_member: true }.classify(Some(Status::Admin)),
            Status::Admin
        );
        assert_eq!(
            ParticipantKind::Unknown.classify(Some(Status::Creator)),
            Status::Creator
        );
        assert_eq!(
            ParticipantKind::Unknown.classify(Some(Status::Left)),
            Status::Member
        );
        assert_eq!(
            ParticipantKind::Member.classify(Some(Status::Admin)),
            Status::Member
        );
        assert_eq!(
            ParticipantKind::Restricted { is_member: false }.classify(None),
            Status::Left
        );
    }

    #[test]
    fn test_chat_config_updates() {
        let mut config = ChatConfig::new(-100);
        config.apply(&ChatConfigUpdate::Track {
            title: Some("Lounge".into()),
        });
        config.apply(&ChatConfigUpdate::Track { title: None });
        config.apply(&ChatConfigUpdate::ToggleThreeStrikes);
        config.apply(&ChatConfigUpdate::SetObligation(Some(-200)));
        assert_eq!(config.title.as_deref(), Some("Lounge"));
        assert!(config.three_strikes_mode);
        assert!(!config.ban_leavers_mode);
        assert_eq!(config.obligation_chat_id, Some(-200));

        assert!(!config.is_fresh(ts(0), Duration::from_secs(600)));
        config.apply(&ChatConfigUpdate::MarkSwept(ts(0)));
        assert!(config.is_fresh(ts(599), Duration::from_secs(600)));
        assert!(!config.is_fresh(ts(601), Duration::from_secs(600)));
    }
}
