//! Utility functions for cutoff parsing and time-window checks.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use crate::error::ModerationError;
use chrono::{DateTime, Utc};
use lazy_regex::lazy_regex;
use std::time::Duration;

/// Match `<amount><unit>` cutoffs such as `3d` or `12h`
static RE_CUTOFF: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^\s*(\d+)\s*([smhdwMy])\s*$");

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Parsed inactivity cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cutoff {
    /// Inactivity span.
    pub span: Duration,
    /// Normalized text, e.g. `3d`.
    pub label: String,
}

/// Parse a cutoff such as `30m`, `2d` or `1y`.
///
/// Units: `s`, `m`, `h`, `d`, `w`, `M` (30 days), `y` (365 days).
///
/// # Errors
///
/// Returns `ModerationError::InvalidCutoff` if the text does not match or the
/// amount is zero or overflows.
pub fn parse_cutoff(text: &str) -> Result<Cutoff, ModerationError> {
    let invalid = || ModerationError::InvalidCutoff(text.trim().to_string());
    let caps = RE_CUTOFF.captures(text).ok_or_else(invalid)?;
    let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    let unit = &caps[2];
    let unit_secs = match unit {
        "s" => 1,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => 7 * DAY,
        "M" => 30 * DAY,
        "y" => 365 * DAY,
        _ => return Err(invalid()),
    };
    let secs = amount.checked_mul(unit_secs).ok_or_else(invalid)?;
    // chrono cannot subtract spans beyond ~292 billion years; cap well below
    if secs > 1000 * 365 * DAY {
        return Err(invalid());
    }
    Ok(Cutoff {
        span: Duration::from_secs(secs),
        label: format!("{amount}{unit}"),
    })
}

/// `now - span`, saturating at the minimum representable time.
#[must_use]
pub fn instant_before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Whether `at` lies within `window` before `now`. `None` is never within.
#[must_use]
pub fn is_within(at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    at.is_some_and(|at| at >= instant_before(now, window))
}
