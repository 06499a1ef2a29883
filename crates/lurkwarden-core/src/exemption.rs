//! Immunity from purges and ban policies.
//!
//! A user is exempt when they administer the chat, are whitelisted there, or
//! their handle contains one of the configured keywords (case-insensitive).

use crate::admin_cache::AdminCache;
use crate::storage::MembershipStore;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Keyword part of the exemption rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExemptKeywords {
    keywords: Vec<String>,
}

impl ExemptKeywords {
    /// Build from keywords; matching ignores case.
    #[must_use]
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Whether the handle contains an exempt keyword.
    #[must_use]
    pub fn matches(&self, handle: Option<&str>) -> bool {
        let Some(handle) = handle else {
            return false;
        };
        let handle = handle.to_lowercase();
        self.keywords.iter().any(|k| handle.contains(k.as_str()))
    }

    /// Full rule given already-fetched admin and whitelist sets.
    #[must_use]
    pub fn is_exempt(
        &self,
        user_id: i64,
        handle: Option<&str>,
        admins: &HashSet<i64>,
        whitelist: &HashSet<i64>,
    ) -> bool {
        admins.contains(&user_id) || whitelist.contains(&user_id) || self.matches(handle)
    }
}

/// Exemption checks backed by the admin cache and the store.
pub struct ExemptionPolicy {
    keywords: ExemptKeywords,
    admin_cache: Arc<AdminCache>,
    store: Arc<dyn MembershipStore>,
}

impl ExemptionPolicy {
    /// Create the policy.
    #[must_use]
    pub fn new(
        keywords: ExemptKeywords,
        admin_cache: Arc<AdminCache>,
        store: Arc<dyn MembershipStore>,
    ) -> Self {
        Self {
            keywords,
            admin_cache,
            store,
        }
    }

    /// Keyword rules.
    #[must_use]
    pub const fn keywords(&self) -> &ExemptKeywords {
        &self.keywords
    }

    /// Whether a single user is exempt in a chat.
    ///
    /// Lookup failures count as exempt: the engine never acts when unsure.
    pub async fn is_exempt(&self, chat_id: i64, user_id: i64, handle: Option<&str>) -> bool {
        if self.keywords.matches(handle) {
            return true;
        }
        match self.admin_cache.is_admin(chat_id, user_id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(chat_id, user_id, error = %e, "Admin lookup failed, treating user as exempt");
                return true;
            }
        }
        match self.store.list_whitelist(chat_id).await {
            Ok(whitelist) => whitelist.contains(&user_id),
            Err(e) => {
                warn!(chat_id, user_id, error = %e, "Whitelist lookup failed, treating user as exempt");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_keyword_matching_ignores_case() {
        let keywords = ExemptKeywords::new(["Shinanygans", " "]);
        assert!(keywords.matches(Some("the_SHINANYGANS_fan")));
        assert!(!keywords.matches(Some("lurker")));
        assert!(!keywords.matches(None));
        assert!(!ExemptKeywords::default().matches(Some("anything")));
    }

    proptest! {
        #[test]
        fn prop_admins_and_whitelisted_always_exempt(
            user_id in any::<i64>(),
            others in proptest::collection::hash_set(any::<i64>(), 0..20),
            handle in proptest::option::of("[a-z_]{0,12}"),
            as_admin in any::<bool>(),
        ) {
            let keywords = ExemptKeywords::new(["vip"]);
            let mut listed = others.clone();
            listed.insert(user_id);
            let (admins, whitelist) = if as_admin {
                (listed, others)
            } else {
                (others, listed)
            };
            prop_assert!(keywords.is_exempt(user_id, handle.as_deref(), &admins, &whitelist));
        }

        #[test]
        fn prop_keyword_anywhere_in_handle_is_exempt(prefix in "[a-z]{0,8}", suffix in "[a-z]{0,8}") {
            let keywords = ExemptKeywords::new(["vip"]);
            let handle = format!("{prefix}VIP{suffix}");
            prop_assert!(keywords.is_exempt(1, Some(&handle), &HashSet::new(), &HashSet::new()));
        }
    }
}
