//! Configuration and settings management
//!
//! Loads moderation settings from config files and environment variables and
//! defines the engine's tunable constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which persistence backend to use.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, lost on restart.
    #[default]
    Memory,
    /// Cloudflare R2 / S3 compatible object storage.
    R2,
}

/// Moderation engine settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ModerationSettings {
    /// Persistence backend
    #[serde(default)]
    pub store_backend: StoreBackend,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// Comma-separated handle fragments that grant purge immunity
    #[serde(rename = "exempt_keywords")]
    pub exempt_keywords_str: Option<String>,

    /// Notice sent before an obligation removal. `{user}` and `{chat}` are substituted.
    pub obligation_notice: Option<String>,

    /// Chat receiving unexpected-error diagnostics
    pub operator_chat_id: Option<i64>,
}

impl ModerationSettings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let mut settings: Self = build_config()?.try_deserialize()?;

        // Fallback: Check environment variables directly if config didn't pick them up
        for (slot, var) in [
            (&mut settings.r2_endpoint_url, "R2_ENDPOINT_URL"),
            (&mut settings.r2_access_key_id, "R2_ACCESS_KEY_ID"),
            (&mut settings.r2_secret_access_key, "R2_SECRET_ACCESS_KEY"),
            (&mut settings.r2_bucket_name, "R2_BUCKET_NAME"),
        ] {
            if slot.is_none() {
                if let Ok(val) = std::env::var(var) {
                    if !val.is_empty() {
                        *slot = Some(val);
                    }
                }
            }
        }

        Ok(settings)
    }

    /// Lowercased handle fragments granting immunity.
    #[must_use]
    pub fn exempt_keywords(&self) -> Vec<String> {
        self.exempt_keywords_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Notice template used by the obligation enforcer.
    #[must_use]
    pub fn obligation_notice(&self) -> String {
        self.obligation_notice
            .clone()
            .unwrap_or_else(|| DEFAULT_OBLIGATION_NOTICE.to_string())
    }
}

/// Build the layered configuration source shared by every settings struct.
///
/// # Errors
///
/// Returns a `ConfigError` if a configuration source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // This file shouldn't be checked into git
        .add_source(File::with_name("config/local").required(false))
        // Eg.. `APP__STORE_BACKEND=r2 ./target/app` would set the `store_backend` key
        .add_source(Environment::with_prefix("APP").separator("__"))
        // ignore_empty treats empty env vars as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

/// Default notice sent to a user removed for missing an obligation chat.
pub const DEFAULT_OBLIGATION_NOTICE: &str =
    "{user}, members of this chat must also be members of {chat}. Join it and come back.";

/// Number of concurrent batches a purge is split into.
pub const NUM_BATCHES: usize = 10;
/// Attempts per gateway call before the item is skipped.
pub const MAX_RETRIES: u32 = 3;
/// Backoff (seconds) after a transient gateway failure.
pub const TRANSIENT_BACKOFF_SECS: u64 = 5;
/// A chat's last sweep must be this recent (seconds) for ban policies to fire.
pub const FRESHNESS_WINDOW_SECS: u64 = 600; // 10 minutes
/// Admin cache entry lifetime (seconds).
pub const ADMIN_CACHE_TTL_SECS: u64 = 3600; // 1 hour
/// Maximum number of chats held in the admin cache.
pub const ADMIN_CACHE_MAX_SIZE: u64 = 10_000;
/// Interval (seconds) between full sweeps.
pub const SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes
/// Lifetime (seconds) of an unused hall pass.
pub const HALL_PASS_TTL_SECS: u64 = 600;
/// Poll interval (milliseconds) while a purge waits for sweeps to drain.
pub const DRAIN_POLL_MS: u64 = 500;
/// Grace window (seconds) for users removed by the obligation enforcer. 0 disables it.
pub const OBLIGATION_GRACE_SECS: u64 = 0;
/// How long (seconds) obligation removals are remembered for the grace window.
pub const OBLIGATION_HISTORY_TTL_SECS: u64 = 86_400;

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Get purge batch count from env or default.
///
/// Environment variable: `NUM_BATCHES`. Values below 1 are raised to 1.
#[must_use]
pub fn get_num_batches() -> usize {
    env_or("NUM_BATCHES", NUM_BATCHES).max(1)
}

/// Get retry ceiling from env or default.
///
/// Environment variable: `MAX_RETRIES`.
#[must_use]
pub fn get_max_retries() -> u32 {
    env_or("MAX_RETRIES", MAX_RETRIES).max(1)
}

/// Get transient backoff from env or default.
///
/// Environment variable: `TRANSIENT_BACKOFF_SECS`.
#[must_use]
pub fn get_transient_backoff() -> Duration {
    Duration::from_secs(env_or("TRANSIENT_BACKOFF_SECS", TRANSIENT_BACKOFF_SECS))
}

/// Get sweep freshness window from env or default.
///
/// Environment variable: `FRESHNESS_WINDOW_SECS`.
#[must_use]
pub fn get_freshness_window() -> Duration {
    Duration::from_secs(env_or("FRESHNESS_WINDOW_SECS", FRESHNESS_WINDOW_SECS))
}

/// Get admin cache TTL from env or default.
///
/// Environment variable: `ADMIN_CACHE_TTL_SECS`.
#[must_use]
pub fn get_admin_cache_ttl() -> Duration {
    Duration::from_secs(env_or("ADMIN_CACHE_TTL_SECS", ADMIN_CACHE_TTL_SECS))
}

/// Get sweep interval from env or default.
///
/// Environment variable: `SWEEP_INTERVAL_SECS`.
#[must_use]
pub fn get_sweep_interval() -> Duration {
    Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", SWEEP_INTERVAL_SECS).max(1))
}

/// Get hall pass TTL from env or default.
///
/// Environment variable: `HALL_PASS_TTL_SECS`.
#[must_use]
pub fn get_hall_pass_ttl() -> Duration {
    Duration::from_secs(env_or("HALL_PASS_TTL_SECS", HALL_PASS_TTL_SECS))
}

/// Get sweep drain poll interval from env or default.
///
/// Environment variable: `DRAIN_POLL_MS`.
#[must_use]
pub fn get_drain_poll() -> Duration {
    Duration::from_millis(env_or("DRAIN_POLL_MS", DRAIN_POLL_MS).max(1))
}

/// Get obligation grace window from env or default.
///
/// Environment variable: `OBLIGATION_GRACE_SECS`.
#[must_use]
pub fn get_obligation_grace() -> Duration {
    Duration::from_secs(env_or("OBLIGATION_GRACE_SECS", OBLIGATION_GRACE_SECS))
}

/// Resolved engine tunables.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Concurrent purge batches.
    pub num_batches: usize,
    /// Attempts per gateway call.
    pub max_retries: u32,
    /// Backoff after a transient failure.
    pub transient_backoff: Duration,
    /// Sweep freshness window.
    pub freshness_window: Duration,
    /// Admin cache TTL.
    pub admin_cache_ttl: Duration,
    /// Hall pass TTL.
    pub hall_pass_ttl: Duration,
    /// Drain poll interval.
    pub drain_poll: Duration,
    /// Obligation grace window.
    pub obligation_grace: Duration,
}

impl EngineTuning {
    /// Read every tunable from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            num_batches: get_num_batches(),
            max_retries: get_max_retries(),
            transient_backoff: get_transient_backoff(),
            freshness_window: get_freshness_window(),
            admin_cache_ttl: get_admin_cache_ttl(),
            hall_pass_ttl: get_hall_pass_ttl(),
            drain_poll: get_drain_poll(),
            obligation_grace: get_obligation_grace(),
        }
    }
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            num_batches: NUM_BATCHES,
            max_retries: MAX_RETRIES,
            transient_backoff: Duration::from_secs(TRANSIENT_BACKOFF_SECS),
            freshness_window: Duration::from_secs(FRESHNESS_WINDOW_SECS),
            admin_cache_ttl: Duration::from_secs(ADMIN_CACHE_TTL_SECS),
            hall_pass_ttl: Duration::from_secs(HALL_PASS_TTL_SECS),
            drain_poll: Duration::from_millis(DRAIN_POLL_MS),
            obligation_grace: Duration::from_secs(OBLIGATION_GRACE_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_parsing() {
        let mut settings = ModerationSettings::default();
        assert!(settings.exempt_keywords().is_empty());

        settings.exempt_keywords_str = Some("Shinanygans, vip;  Staff".to_string());
        assert_eq!(
            settings.exempt_keywords(),
            vec!["shinanygans".to_string(), "vip".into(), "staff".into()]
        );
    }

    #[test]
    fn test_notice_default() {
        let mut settings = ModerationSettings::default();
        assert_eq!(settings.obligation_notice(), DEFAULT_OBLIGATION_NOTICE);
        settings.obligation_notice = Some("bye {user}".into());
        assert_eq!(settings.obligation_notice(), "bye {user}");
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = EngineTuning::default();
        assert_eq!(tuning.num_batches, 10);
        assert_eq!(tuning.max_retries, 3);
        assert_eq!(tuning.freshness_window, Duration::from_secs(600));
        assert_eq!(tuning.admin_cache_ttl, Duration::from_secs(3600));
        assert_eq!(tuning.obligation_grace, Duration::ZERO);
    }

    #[test]
    fn test_backend_deserialize() -> Result<(), Box<dyn std::error::Error>> {
        let backend: StoreBackend = serde_json::from_str("\"r2\"")?;
        assert_eq!(backend, StoreBackend::R2);
        Ok(())
    }
}
