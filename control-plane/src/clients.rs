//! Client lifecycle: registration, authentication, key rotation, staleness GC.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use control_plane_task::{ShutdownSignal, Task};
use parking_lot::RwLock;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clusters::ClusterRegistry;
use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub node_type: String,
    pub name: String,
    pub cluster_id: Uuid,
    /// WireGuard public key the client announced at registration, if any.
    pub public_key: Option<String>,
    pub api_key_hash: String,
    /// Set only while a rotation grace window is active; see
    /// [`ClientRegistryConfig::rotate_key_grace_seconds`].
    pub pending_api_key_hash: Option<String>,
    pub pending_api_key_expires_at: Option<OffsetDateTime>,
    pub status: ClientStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub node_type: String,
    pub name: String,
    pub preferred_datacenter: Option<String>,
    pub preferred_region: Option<String>,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientRegistryConfig {
    /// `None` means atomic swap (§9's resolved default); `Some(secs)`
    /// reproduces `client_registry.py::rotate_api_key`'s temporary-key grace
    /// window (3600 s in the source).
    pub rotate_key_grace_seconds: Option<u64>,
}

impl Default for ClientRegistryConfig {
    fn default() -> Self {
        Self {
            rotate_key_grace_seconds: None,
        }
    }
}

const STALE_LAST_SEEN: Duration = Duration::hours(24);
const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, Client>>,
    clusters: Arc<ClusterRegistry>,
    config: ClientRegistryConfig,
}

impl ClientRegistry {
    pub fn new(clusters: Arc<ClusterRegistry>, config: ClientRegistryConfig) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            clusters,
            config,
        }
    }

    pub fn register(&self, desc: ClientDescriptor) -> Result<(Client, String)> {
        let cluster = self
            .clusters
            .optimal_for(desc.preferred_datacenter.as_deref(), desc.preferred_region.as_deref())
            .ok_or_else(|| ControlPlaneError::unavailable("no active cluster is available to host this client"))?;

        let api_key = generate_api_key();
        let api_key_hash = hash_api_key(&api_key);

        let client = Client {
            id: Uuid::new_v4(),
            node_type: desc.node_type,
            name: desc.name,
            cluster_id: cluster.id,
            public_key: desc.public_key,
            api_key_hash,
            pending_api_key_hash: None,
            pending_api_key_expires_at: None,
            status: ClientStatus::Pending,
            last_seen: OffsetDateTime::now_utc(),
        };

        self.clients.write().insert(client.id, client.clone());

        Ok((client, api_key))
    }

    pub fn authenticate(&self, api_key: &str) -> Option<Client> {
        let hash = hash_api_key(api_key);
        let now = OffsetDateTime::now_utc();

        let mut guard = self.clients.write();
        let client = guard.values_mut().find(|c| {
            c.api_key_hash == hash
                || c.pending_api_key_hash.as_deref() == Some(hash.as_str())
                    && c.pending_api_key_expires_at.is_some_and(|exp| now < exp)
        })?;

        client.last_seen = now;
        client.status = ClientStatus::Active;
        Some(client.clone())
    }

    /// Atomically swaps the key hash by default. When
    /// [`ClientRegistryConfig::rotate_key_grace_seconds`] is set, the old
    /// hash keeps validating for that many seconds via `pending_api_key_hash`
    /// becoming the new primary only after the window elapses, reproducing
    /// the source's temporary-key behavior.
    pub fn rotate_api_key(&self, client_id: Uuid) -> Option<String> {
        let new_api_key = generate_api_key();
        let new_hash = hash_api_key(&new_api_key);

        let mut guard = self.clients.write();
        let client = guard.get_mut(&client_id)?;

        match self.config.rotate_key_grace_seconds {
            None => {
                client.api_key_hash = new_hash;
                client.pending_api_key_hash = None;
                client.pending_api_key_expires_at = None;
            }
            Some(grace_secs) => {
                client.pending_api_key_hash = Some(client.api_key_hash.clone());
                client.pending_api_key_expires_at = Some(OffsetDateTime::now_utc() + Duration::seconds(grace_secs as i64));
                client.api_key_hash = new_hash;
            }
        }

        Some(new_api_key)
    }

    pub fn get(&self, id: Uuid) -> Option<Client> {
        self.clients.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Client> {
        self.clients.read().values().cloned().collect()
    }

    fn evict_stale(&self, now: OffsetDateTime) -> usize {
        let mut guard = self.clients.write();
        let before = guard.len();
        guard.retain(|_, c| c.status == ClientStatus::Active || now - c.last_seen <= STALE_LAST_SEEN);
        before - guard.len()
    }
}

fn generate_api_key() -> String {
    use base64::Engine as _;

    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Background GC removing clients whose `last_seen` is older than 24h and
/// whose status is not `active`, mirroring
/// `client_registry.py::_cleanup_stale_clients`.
pub struct ClientCleanupTask {
    pub registry: Arc<ClientRegistry>,
}

#[async_trait]
impl Task for ClientCleanupTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "client staleness gc";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                _ = shutdown_signal.wait() => break,
            }

            let removed = self.registry.evict_stale(OffsetDateTime::now_utc());
            if removed > 0 {
                tracing::info!(removed, "evicted stale clients");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::ClusterDescriptor;

    fn registry_with_one_active_cluster() -> (Arc<ClusterRegistry>, ClientRegistry) {
        let clusters = Arc::new(ClusterRegistry::new());
        clusters.register(ClusterDescriptor {
            name: "edge-1".into(),
            datacenter: "dc1".into(),
            region: "us-east".into(),
        });
        let clients = ClientRegistry::new(clusters.clone(), ClientRegistryConfig::default());
        (clusters, clients)
    }

    fn descriptor() -> ClientDescriptor {
        ClientDescriptor {
            node_type: "client_native".into(),
            name: "laptop-1".into(),
            preferred_datacenter: None,
            preferred_region: None,
            public_key: None,
        }
    }

    #[test]
    fn register_requires_an_active_cluster() {
        let clusters = Arc::new(ClusterRegistry::new());
        let clients = ClientRegistry::new(clusters, ClientRegistryConfig::default());
        assert!(clients.register(descriptor()).is_err());
    }

    #[test]
    fn register_then_authenticate_promotes_to_active() {
        let (_clusters, clients) = registry_with_one_active_cluster();
        let (client, api_key) = clients.register(descriptor()).expect("register");
        assert_eq!(client.status, ClientStatus::Pending);

        let authenticated = clients.authenticate(&api_key).expect("authenticate");
        assert_eq!(authenticated.status, ClientStatus::Active);
    }

    #[test]
    fn atomic_rotation_invalidates_old_key_immediately() {
        let (_clusters, clients) = registry_with_one_active_cluster();
        let (client, old_key) = clients.register(descriptor()).expect("register");

        let new_key = clients.rotate_api_key(client.id).expect("rotate");
        assert!(clients.authenticate(&old_key).is_none());
        assert!(clients.authenticate(&new_key).is_some());
    }

    #[test]
    fn grace_window_rotation_accepts_both_keys_until_expiry() {
        let clusters = Arc::new(ClusterRegistry::new());
        clusters.register(ClusterDescriptor {
            name: "edge-1".into(),
            datacenter: "dc1".into(),
            region: "us-east".into(),
        });
        let clients = ClientRegistry::new(
            clusters,
            ClientRegistryConfig {
                rotate_key_grace_seconds: Some(3600),
            },
        );

        let (client, old_key) = clients.register(descriptor()).expect("register");
        let new_key = clients.rotate_api_key(client.id).expect("rotate");

        assert!(clients.authenticate(&old_key).is_some());
        assert!(clients.authenticate(&new_key).is_some());
    }
}
