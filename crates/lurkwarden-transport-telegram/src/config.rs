//! Telegram transport settings.

use config::ConfigError;
use lurkwarden_core::config::ModerationSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Telegram transport settings loaded from environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TelegramSettings {
    /// Telegram Bot API token.
    pub telegram_token: String,
    /// Comma-separated user IDs allowed to run commands. Empty allows every chat admin.
    #[serde(rename = "authorized_admins")]
    pub authorized_admins_str: Option<String>,
}

/// Combined settings used by the Telegram transport layer.
#[derive(Clone)]
pub struct BotSettings {
    /// Engine settings shared across transport handlers.
    pub moderation: Arc<ModerationSettings>,
    /// Telegram-specific settings.
    pub telegram: Arc<TelegramSettings>,
}

impl BotSettings {
    /// Create a new combined settings bundle.
    #[must_use]
    pub fn new(moderation: ModerationSettings, telegram: TelegramSettings) -> Self {
        Self {
            moderation: Arc::new(moderation),
            telegram: Arc::new(telegram),
        }
    }
}

impl TelegramSettings {
    /// Create new settings by loading from environment and files.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        lurkwarden_core::config::build_config()?.try_deserialize()
    }

    /// Returns the set of user IDs allowed to moderate.
    #[must_use]
    pub fn authorized_admins(&self) -> HashSet<i64> {
        self.authorized_admins_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Cooldown period (seconds) between "not authorized" replies in the same chat.
/// Default: 20 minutes.
pub const UNAUTHORIZED_COOLDOWN_SECS: u64 = 1200;
/// Time-to-live (seconds) for cache entries.
/// Default: 2 hours.
pub const UNAUTHORIZED_CACHE_TTL_SECS: u64 = 7200;
/// Maximum cache capacity (number of entries).
pub const UNAUTHORIZED_CACHE_MAX_SIZE: u64 = 10_000;
/// Concurrent point lookups while probing a chat roster.
pub const ROSTER_PROBE_CONCURRENCY: usize = 8;

/// Retries for command replies after the first attempt.
pub const TELEGRAM_SEND_MAX_RETRIES: usize = 3;
/// First backoff (milliseconds) between reply attempts.
pub const TELEGRAM_SEND_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling (milliseconds) between reply attempts.
pub const TELEGRAM_SEND_MAX_BACKOFF_MS: u64 = 5000;

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Get unauthorized cooldown from env or default.
///
/// Environment variable: `UNAUTHORIZED_COOLDOWN_SECS`.
#[must_use]
pub fn get_unauthorized_cooldown() -> u64 {
    env_or("UNAUTHORIZED_COOLDOWN_SECS", UNAUTHORIZED_COOLDOWN_SECS)
}

/// Get unauthorized cache TTL from env or default.
///
/// Environment variable: `UNAUTHORIZED_CACHE_TTL_SECS`.
#[must_use]
pub fn get_unauthorized_cache_ttl() -> u64 {
    env_or("UNAUTHORIZED_CACHE_TTL_SECS", UNAUTHORIZED_CACHE_TTL_SECS)
}

/// Get unauthorized cache max size from env or default.
///
/// Environment variable: `UNAUTHORIZED_CACHE_MAX_SIZE`.
#[must_use]
pub fn get_unauthorized_cache_max_size() -> u64 {
    env_or("UNAUTHORIZED_CACHE_MAX_SIZE", UNAUTHORIZED_CACHE_MAX_SIZE)
}

/// Get roster probe concurrency from env or default.
///
/// Environment variable: `ROSTER_PROBE_CONCURRENCY`. Values below 1 are raised to 1.
#[must_use]
pub fn get_roster_probe_concurrency() -> usize {
    env_or("ROSTER_PROBE_CONCURRENCY", ROSTER_PROBE_CONCURRENCY).max(1)
}
