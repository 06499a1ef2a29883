//! HTML replies for moderation commands.

use chrono::{DateTime, Utc};
use html_escape::encode_text;
use lurkwarden_core::error::ModerationError;
use lurkwarden_core::executor::{PurgeMode, PurgeReport};
use lurkwarden_core::model::{ChatConfig, EscalationRecord};
use lurkwarden_core::moderator::{ChatStats, UserLookup, WhitelistEntry};
use lurkwarden_core::sweeper::{SkipReason, SweepOutcome};
use lurkwarden_core::utils::Cutoff;
use std::fmt::Write as _;

/// Reply for commands from chats no authorized admin moderates.
pub const NOT_AUTHORIZED: &str = "⛔️ This chat is not moderated by an authorized admin.";

/// Reply for commands that only make sense inside a group.
pub const GROUP_ONLY: &str = "This command only works in groups.";

/// Reply for commands that only work in a private chat with the bot.
pub const PRIVATE_ONLY: &str = "This command only works in a private chat with the bot.";

/// Greeting for `/start`.
pub const WELCOME: &str = "Lurkwarden keeps track of who posts media in your groups and removes the lurkers. Add me as an admin, then send /help in the group.";

fn date(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(
        || "never".to_string(),
        |at| at.format("%Y-%m-%d %H:%M UTC").to_string(),
    )
}

const fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

const fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Counts of a finished (or pretended) purge.
#[must_use]
pub fn purge_summary(cutoff: &Cutoff, report: &PurgeReport) -> String {
    let action = match report.mode {
        PurgeMode::Kick => "kick",
        PurgeMode::Ban => "ban",
    };
    let mut out = format!(
        "<b>Inactive {action} ({})</b>\nNo qualifying post since {}\nEligible: {}\n",
        encode_text(&cutoff.label),
        date(Some(report.cutoff_at)),
        report.eligible()
    );
    if report.pretend {
        let _ = write!(
            out,
            "Would kick: {}\nWould ban: {}",
            report.kicked.len(),
            report.banned.len()
        );
    } else {
        let _ = write!(
            out,
            "Kicked: {}\nBanned: {}\nSkipped: {}",
            report.kicked.len(),
            report.banned.len(),
            report.skipped.len()
        );
    }
    out
}

/// New state of a toggled policy.
#[must_use]
pub fn toggled(policy: &str, enabled: bool) -> String {
    format!("{} is now <b>{}</b>.", encode_text(policy), on_off(enabled))
}

/// Obligation state after `/obligation`.
#[must_use]
pub fn obligation_set(config: &ChatConfig) -> String {
    config.obligation_chat_id.map_or_else(
        || "Obligation chat cleared.".to_string(),
        |id| format!("Members must also join <code>{id}</code>."),
    )
}

/// One line per swept chat.
#[must_use]
pub fn sweep_summary(results: &[(i64, SweepOutcome)]) -> String {
    if results.is_empty() {
        return "Nothing swept: no tracked chats, or a purge is running.".to_string();
    }
    let mut out = String::from("<b>Sweep finished</b>");
    for (chat_id, outcome) in results {
        let line = match outcome {
            SweepOutcome::Completed(report) => format!(
                "{} seen, {} new, {} left, {} banned, {} inconclusive",
                report.enumerated,
                report.newly_seen.len(),
                report.left.len(),
                report.policy_banned.len() + report.banned_seen.len(),
                report.inconclusive.len()
            ),
            SweepOutcome::Skipped(SkipReason::Suspended) => "skipped, purge running".into(),
            SweepOutcome::Skipped(SkipReason::AlreadyRunning) => "skipped, already sweeping".into(),
            SweepOutcome::Untracked => "untracked, access lost".into(),
            SweepOutcome::Failed(_) => "failed, see logs".into(),
        };
        let _ = write!(out, "\n<code>{chat_id}</code>: {line}");
    }
    out
}

/// Whitelist change confirmation.
#[must_use]
pub fn whitelist_changed(user: &str, added: bool, changed: bool) -> String {
    let user = encode_text(user);
    match (added, changed) {
        (true, true) => format!("{user} added to the whitelist."),
        (true, false) => format!("{user} is already whitelisted."),
        (false, true) => format!("{user} removed from the whitelist."),
        (false, false) => format!("{user} was not whitelisted."),
    }
}

/// Whitelists grouped by chat.
#[must_use]
pub fn whitelist(entries: &[WhitelistEntry]) -> String {
    if entries.is_empty() {
        return "Whitelist is empty.".to_string();
    }
    let mut out = String::from("<b>Whitelist</b>");
    for entry in entries {
        let _ = write!(out, "\n\n<b>{}</b>", encode_text(&entry.chat_name));
        for (user_id, name) in &entry.users {
            let _ = write!(out, "\n• {} (<code>{user_id}</code>)", encode_text(name));
        }
    }
    out
}

fn escalation(label: &str, record: &EscalationRecord) -> String {
    if record.count == 0 {
        format!("{label}: 0")
    } else {
        format!("{label}: {} (last {})", record.count, date(record.last_action_at))
    }
}

/// Everything stored about one user.
#[must_use]
pub fn lookup(lookup: &UserLookup) -> String {
    let Some(record) = &lookup.record else {
        return format!(
            "No record of <code>{}</code> in this chat.",
            lookup.user_id
        );
    };
    let mut out = format!(
        "<b>{}</b> (<code>{}</code>)\nStatus: {}\nFirst joined: {}\nLast joined: {}\nLast left: {}\nLast posted: {}\nActivity tracked: {}\nJoins/leaves: {}/{}\n{}\n{}\nWhitelisted: {}",
        encode_text(&record.profile().mention()),
        lookup.user_id,
        record.status.label(),
        date(record.first_joined),
        date(record.last_joined),
        date(record.last_left),
        date(lookup.last_posted),
        yes_no(lookup.activity_tracked),
        record.times_joined,
        record.times_left,
        escalation("Kicks", &lookup.kicks),
        escalation("Bans", &lookup.bans),
        yes_no(lookup.whitelisted),
    );
    if record.is_bot || record.is_scam || record.is_fake {
        let _ = write!(
            out,
            "\nFlags: bot {}, scam {}, fake {}",
            yes_no(record.is_bot),
            yes_no(record.is_scam),
            yes_no(record.is_fake)
        );
    }
    if !lookup.other_chats.is_empty() {
        let chats: Vec<String> = lookup
            .other_chats
            .iter()
            .map(|(chat_id, status)| format!("<code>{chat_id}</code> ({})", status.label()))
            .collect();
        let _ = write!(out, "\nOther chats: {}", chats.join(", "));
    }
    out
}

/// Chat statistics over a window.
#[must_use]
pub fn stats(stats: &ChatStats) -> String {
    let config = &stats.config;
    let obligation = config
        .obligation_chat_id
        .map_or_else(|| "none".to_string(), |id| format!("<code>{id}</code>"));
    format!(
        "<b>{}</b> over {}\nMembers: {} ({} admins)\nPosted: {}\nNever posted: {}\nJoined: {}\nLeft: {}\nKicked: {}\nBanned: {}\nWhitelisted: {}\n\nThree strikes: {}\nBan leavers: {}\nObligation: {obligation}\nLast sweep: {}",
        encode_text(&config.display_name()),
        encode_text(&stats.window),
        stats.members,
        stats.admins,
        stats.posted_within,
        stats.never_posted,
        stats.joined_within,
        stats.left_within,
        stats.kicked_within,
        stats.banned_within,
        stats.whitelisted,
        on_off(config.three_strikes_mode),
        on_off(config.ban_leavers_mode),
        date(config.last_sweep_at),
    )
}

/// Result of `/cleandb`.
#[must_use]
pub fn cleaned(removed: &[i64]) -> String {
    if removed.is_empty() {
        return "Every tracked chat is still reachable.".to_string();
    }
    let ids: Vec<String> = removed.iter().map(|id| format!("<code>{id}</code>")).collect();
    format!("Removed {} unreachable chat(s): {}", removed.len(), ids.join(", "))
}

/// User-facing text of an engine error. Internal failures stay in the logs.
#[must_use]
pub fn error(err: &ModerationError) -> String {
    match err {
        ModerationError::PurgeInProgress => {
            "A purge is already running. Try again when it finishes.".to_string()
        }
        ModerationError::InvalidCutoff(text) => format!(
            "Invalid duration <code>{}</code>. Use e.g. 30m, 12h, 3d, 2w, 1M, 1y.",
            encode_text(text)
        ),
        ModerationError::ChatNotTracked(chat_id) => {
            format!("Chat <code>{chat_id}</code> is not tracked.")
        }
        ModerationError::ChatUntracked(chat_id) => {
            format!("Lost access to chat <code>{chat_id}</code>, it is no longer tracked.")
        }
        ModerationError::InvalidArgument(message) => encode_text(message).into_owned(),
        ModerationError::Gateway(_) | ModerationError::Storage(_) => {
            "Something went wrong, see the logs.".to_string()
        }
    }
}
