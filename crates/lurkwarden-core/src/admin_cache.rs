//! Per-chat admin id cache.
//!
//! Entries expire after a TTL and are refreshed on the next lookup. Observed
//! promotions and demotions patch the cached set in place. A refresh that hits
//! a chat-level access error untracks the chat.

use crate::gateway::{ChatGateway, GatewayError};
use crate::model::ChatConfigUpdate;
use crate::retry::RetryPolicy;
use crate::storage::MembershipStore;
use chrono::Utc;
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Admin ids of one chat.
pub type AdminSet = Arc<HashSet<i64>>;

/// TTL cache of chat admin sets.
pub struct AdminCache {
    cache: Cache<i64, AdminSet>,
    gateway: Arc<dyn ChatGateway>,
    store: Arc<dyn MembershipStore>,
    retry: RetryPolicy,
}

impl AdminCache {
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<dyn MembershipStore>,
        retry: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(crate::config::ADMIN_CACHE_MAX_SIZE)
                .time_to_live(ttl)
                .build(),
            gateway,
            store,
            retry,
        }
    }

    /// Admin ids of a chat, refreshed from the platform on miss or expiry.
    ///
    /// # Errors
    ///
    /// Returns the gateway error when the refresh fails. Chat-level access
    /// errors additionally untrack the chat.
    pub async fn admins(&self, chat_id: i64) -> Result<AdminSet, GatewayError> {
        self.cache
            .try_get_with(chat_id, self.refresh(chat_id))
            .await
            .map_err(|e: Arc<GatewayError>| (*e).clone())
    }

    /// Whether the user administers the chat.
    ///
    /// # Errors
    ///
    /// See [`AdminCache::admins`].
    pub async fn is_admin(&self, chat_id: i64, user_id: i64) -> Result<bool, GatewayError> {
        Ok(self.admins(chat_id).await?.contains(&user_id))
    }

    async fn refresh(&self, chat_id: i64) -> Result<AdminSet, GatewayError> {
        let result = self
            .retry
            .run("get_administrators", || {
                self.gateway.get_administrators(chat_id)
            })
            .await;

        match result {
            Ok(ids) => {
                debug!(chat_id, count = ids.len(), "Admin list refreshed");
                // Untracked chats stay untracked
                if let Err(e) = self
                    .store
                    .touch_chat_config(chat_id, ChatConfigUpdate::MarkAdminRefresh(Utc::now()))
                    .await
                {
                    warn!(chat_id, error = %e, "Failed to record admin refresh");
                }
                Ok(Arc::new(ids.into_iter().collect()))
            }
            Err(err) if err.is_chat_loss() => {
                warn!(chat_id, error = %err, "Lost access to chat, untracking it");
                if let Err(e) = self.store.delete_chat(chat_id).await {
                    error!(chat_id, error = %e, "Failed to untrack chat");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Record an observed promotion.
    pub async fn note_promoted(&self, chat_id: i64, user_id: i64) {
        self.patch(chat_id, |admins| {
            admins.insert(user_id);
        })
        .await;
    }

    /// Record an observed demotion.
    pub async fn note_demoted(&self, chat_id: i64, user_id: i64) {
        self.patch(chat_id, |admins| {
            admins.remove(&user_id);
        })
        .await;
    }

    async fn patch(&self, chat_id: i64, change: impl FnOnce(&mut HashSet<i64>) + Send) {
        // Only patch live entries; a miss is refreshed in full on next lookup
        if let Some(current) = self.cache.get(&chat_id).await {
            let mut admins = (*current).clone();
            change(&mut admins);
            self.cache.insert(chat_id, Arc::new(admins)).await;
        }
    }

    /// Drop the cached entry of a chat.
    pub async fn invalidate(&self, chat_id: i64) {
        self.cache.invalidate(&chat_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockChatGateway;
    use crate::storage::{MemoryStore, MembershipStore};
    use mockall::predicate::eq;

    fn cache_with(gateway: MockChatGateway, store: Arc<MemoryStore>) -> AdminCache {
        AdminCache::new(
            Arc::new(gateway),
            store,
            RetryPolicy::default(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_refreshes_once_then_serves_cache() -> Result<(), Box<dyn std::error::Error>> {
        let mut gateway = MockChatGateway::new();
        gateway
            .expect_get_administrators()
            .with(eq(-1))
            .times(1)
            .returning(|_| Ok(vec![10, 11]));
        let store = Arc::new(MemoryStore::in_memory());
        store
            .update_chat_config(-1, ChatConfigUpdate::Track { title: None })
            .await?;
        let cache = cache_with(gateway, Arc::clone(&store));

        assert!(cache.is_admin(-1, 10).await?);
        assert!(!cache.is_admin(-1, 12).await?);
        let config = store.get_chat_config(-1).await?;
        assert!(config.and_then(|c| c.last_admin_refresh_at).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_does_not_track_unknown_chat() -> Result<(), Box<dyn std::error::Error>> {
        let mut gateway = MockChatGateway::new();
        gateway
            .expect_get_administrators()
            .with(eq(-7))
            .times(1)
            .returning(|_| Ok(vec![10]));
        let store = Arc::new(MemoryStore::in_memory());
        let cache = cache_with(gateway, Arc::clone(&store));

        assert!(cache.is_admin(-7, 10).await?);
        assert!(store.get_chat_config(-7).await?.is_none());
        assert!(store.list_chat_ids().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_promotions_patch_live_entries() -> Result<(), GatewayError> {
        let mut gateway = MockChatGateway::new();
        gateway
            .expect_get_administrators()
            .times(1)
            .returning(|_| Ok(vec![10]));
        let cache = cache_with(gateway, Arc::new(MemoryStore::in_memory()));

        cache.admins(-1).await?;
        cache.note_promoted(-1, 20).await;
        cache.note_demoted(-1, 10).await;
        let admins = cache.admins(-1).await?;
        assert_eq!(*admins, HashSet::from([20]));
        Ok(())
    }

    #[tokio::test]
    async fn test_access_loss_untracks_chat() -> Result<(), Box<dyn std::error::Error>> {
        let mut gateway = MockChatGateway::new();
        gateway
            .expect_get_administrators()
            .returning(|_| Err(GatewayError::PermissionDenied("bot was kicked".into())));
        let store = Arc::new(MemoryStore::in_memory());
        store
            .update_chat_config(-1, ChatConfigUpdate::Track { title: None })
            .await?;
        let cache = cache_with(gateway, Arc::clone(&store));

        let result = cache.admins(-1).await;
        assert!(matches!(result, Err(GatewayError::PermissionDenied(_))));
        assert!(store.get_chat_config(-1).await?.is_none());
        Ok(())
    }
}
