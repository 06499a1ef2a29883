//! Cooldown for "not authorized" replies.
//!
//! Commands from chats that no authorized admin moderates are answered at most
//! once per cooldown per chat, so a busy group cannot make the bot spam refusals
//! and hit flood control.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tracks when each chat last received a refusal.
#[derive(Clone)]
pub struct UnauthorizedCache {
    replied: Cache<i64, ()>,
    silenced: Arc<AtomicU64>,
}

impl UnauthorizedCache {
    /// Create the cache.
    ///
    /// Entries expire after `cooldown_secs`; `ttl_secs` bounds how long idle
    /// entries are kept when it is shorter.
    #[must_use]
    pub fn new(cooldown_secs: u64, ttl_secs: u64, max_capacity: u64) -> Self {
        let lifetime = Duration::from_secs(cooldown_secs.min(ttl_secs).max(1));
        Self {
            replied: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(lifetime)
                .build(),
            silenced: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether the chat may receive a refusal now.
    ///
    /// Every 100th silenced command is logged.
    #[must_use]
    pub fn should_reply(&self, chat_id: i64, user_id: i64) -> bool {
        if !self.replied.contains_key(&chat_id) {
            return true;
        }
        let count = self.silenced.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(chat_id, user_id, silenced = count, "Unauthorized commands silenced");
        }
        false
    }

    /// Start the cooldown after a refusal was delivered.
    pub async fn mark_replied(&self, chat_id: i64) {
        self.replied.insert(chat_id, ()).await;
    }

    /// Commands silenced so far.
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced.load(Ordering::Relaxed)
    }
}
