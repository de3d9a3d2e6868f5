//! In-process fallback implementation of [`crate::token::TokenCacheBackend`],
//! used when no `redis_url` is configured. Single-process deployments don't
//! need a shared cache; everything else about the token lifecycle (TTL,
//! revocation, owner indexing) behaves the same as [`crate::redis_backend`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::token::{TokenCacheBackend, TokenMetadata};

struct Entry {
    metadata: TokenMetadata,
    expires_at: OffsetDateTime,
}

#[derive(Default)]
pub struct InProcessTokenCache {
    entries: Mutex<HashMap<Uuid, Entry>>,
    owners: Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl InProcessTokenCache {
    pub fn new() -> Arc<dyn TokenCacheBackend> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TokenCacheBackend for InProcessTokenCache {
    async fn put(&self, jti: Uuid, metadata: &TokenMetadata, ttl_secs: u64) -> anyhow::Result<()> {
        let expires_at = OffsetDateTime::now_utc() + time::Duration::seconds(ttl_secs.max(1) as i64);
        self.entries.lock().insert(
            jti,
            Entry {
                metadata: metadata.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, jti: Uuid) -> anyhow::Result<Option<TokenMetadata>> {
        let guard = self.entries.lock();
        Ok(guard.get(&jti).filter(|e| e.expires_at > OffsetDateTime::now_utc()).map(|e| e.metadata.clone()))
    }

    async fn mark_inactive(&self, jti: Uuid) -> anyhow::Result<bool> {
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.get_mut(&jti) {
            entry.metadata.active = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn index_for_owner(&self, node_id: &str, jti: Uuid) -> anyhow::Result<()> {
        self.owners.lock().entry(node_id.to_owned()).or_default().insert(jti);
        Ok(())
    }

    async fn owned_by(&self, node_id: &str) -> anyhow::Result<HashSet<Uuid>> {
        Ok(self.owners.lock().get(node_id).cloned().unwrap_or_default())
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.entries.lock();
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        Ok((before - guard.len()) as u64)
    }
}
