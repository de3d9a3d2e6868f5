//! Redis-backed cache of compiled [`RuleBundle`]s in front of the Policy
//! Store, keyed under the `firewall:` namespace.
//!
//! Invalidation is mutation-driven, not TTL-driven: any rule write clears
//! the affected entries immediately so a stale bundle is never served after
//! a known change, even though entries also carry a TTL as a backstop.

use std::collections::HashMap;
use std::sync::Arc;

use redis::AsyncCommands as _;

use crate::policy::{PolicyStore, RuleBundle};

const USER_TTL_SECS: u64 = 300;
const ALL_RULES_TTL_SECS: u64 = 180;

fn user_key(user_id: &str) -> String {
    format!("firewall:user:{user_id}")
}

const ALL_RULES_KEY: &str = "firewall:all_rules";

pub struct RuleCache {
    redis: Option<redis::Client>,
    store: Arc<PolicyStore>,
}

impl RuleCache {
    pub fn new(redis: Option<redis::Client>, store: Arc<PolicyStore>) -> Self {
        Self { redis, store }
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        let client = self.redis.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(error = %e, "rule cache unavailable, falling through to policy store");
                None
            }
        }
    }

    /// Returns the user's compiled bundle, serving from cache on a hit and
    /// compiling + writing back on a miss. Falls through to the Policy Store
    /// directly whenever Redis is unreachable.
    pub async fn get_user_bundle(&self, user_id: &str) -> RuleBundle {
        let Some(mut conn) = self.connection().await else {
            return self.store.export_user(user_id);
        };

        let key = user_key(user_id);
        if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
            if let Ok(bundle) = serde_json::from_str::<RuleBundle>(&raw) {
                return bundle;
            }
        }

        let bundle = self.store.export_user(user_id);
        if let Ok(raw) = serde_json::to_string(&bundle) {
            let _: Result<(), _> = conn.set_ex(&key, raw, USER_TTL_SECS).await;
        }

        bundle
    }

    /// Invalidates the bundle for one user plus the aggregate view, called
    /// after any mutation whose affected user is known.
    pub async fn invalidate_user(&self, user_id: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let _: Result<(), _> = conn.del(user_key(user_id)).await;
        let _: Result<(), _> = conn.del(ALL_RULES_KEY).await;
    }

    /// Broad invalidation for mutations whose affected user cannot be
    /// determined without a read first (e.g. deletion by rule id alone).
    pub async fn invalidate_all(&self) {
        let Some(mut conn) = self.connection().await else {
            return;
        };

        let pattern = "firewall:*";
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .unwrap_or_default();

        if !keys.is_empty() {
            let _: Result<(), _> = conn.del(keys).await;
        }
    }

    pub async fn get_all_bundle(&self) -> HashMap<String, RuleBundle> {
        if let Some(mut conn) = self.connection().await {
            if let Ok(Some(raw)) = conn.get::<_, Option<String>>(ALL_RULES_KEY).await {
                if let Ok(bundles) = serde_json::from_str::<HashMap<String, RuleBundle>>(&raw) {
                    return bundles;
                }
            }
        }

        let bundles: HashMap<String, RuleBundle> = self
            .store
            .get_all()
            .keys()
            .map(|user_id| (user_id.clone(), self.store.export_user(user_id)))
            .collect();

        if let Some(mut conn) = self.connection().await {
            if let Ok(raw) = serde_json::to_string(&bundles) {
                let _: Result<(), _> = conn.set_ex(ALL_RULES_KEY, raw, ALL_RULES_TTL_SECS).await;
            }
        }

        bundles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AccessRule, AccessType, RuleType};
    use uuid::Uuid;

    #[tokio::test]
    async fn falls_through_to_policy_store_without_redis() {
        let store = Arc::new(PolicyStore::new());
        store.add(AccessRule {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            rule_type: RuleType::Domain,
            access_type: AccessType::Allow,
            pattern: "example.com".into(),
            priority: 10,
            is_active: true,
        });

        let cache = RuleCache::new(None, store);
        let bundle = cache.get_user_bundle("alice").await;
        assert_eq!(bundle.allow_domains, vec!["example.com".to_string()]);
    }
}
