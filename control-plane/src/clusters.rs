//! Cluster enrollment, heartbeat, and optimal-placement selection.

use std::collections::HashMap;

use async_trait::async_trait;
use control_plane_task::{ShutdownSignal, Task};
use parking_lot::RwLock;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Active,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub datacenter: String,
    pub region: String,
    pub headend_url: String,
    pub api_key_hash: String,
    pub status: ClusterStatus,
    pub client_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ClusterDescriptor {
    pub name: String,
    pub datacenter: String,
    pub region: String,
    pub headend_url: String,
}

const STALE_THRESHOLD: Duration = Duration::minutes(5);
const HEALTH_MONITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

pub struct ClusterRegistry {
    clusters: RwLock<HashMap<Uuid, Cluster>>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, desc: ClusterDescriptor) -> (Cluster, String) {
        let api_key = generate_api_key();
        let api_key_hash = hash_api_key(&api_key);

        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: desc.name,
            datacenter: desc.datacenter,
            region: desc.region,
            headend_url: desc.headend_url,
            api_key_hash,
            status: ClusterStatus::Active,
            client_count: 0,
            last_heartbeat: OffsetDateTime::now_utc(),
        };

        self.clusters.write().insert(cluster.id, cluster.clone());

        (cluster, api_key)
    }

    pub fn authenticate(&self, api_key: &str) -> Option<Cluster> {
        let hash = hash_api_key(api_key);
        self.clusters.read().values().find(|c| c.api_key_hash == hash).cloned()
    }

    pub fn heartbeat(&self, id: Uuid, client_count: Option<u64>) -> bool {
        let mut guard = self.clusters.write();
        match guard.get_mut(&id) {
            Some(cluster) => {
                cluster.last_heartbeat = OffsetDateTime::now_utc();
                cluster.status = ClusterStatus::Active;
                if let Some(count) = client_count {
                    cluster.client_count = count;
                }
                true
            }
            None => false,
        }
    }

    /// Prefers an exact datacenter match, then region, then any cluster;
    /// among candidates, the active cluster with the fewest clients wins.
    /// Returns `None` (→ 503 at the handler) when no active cluster exists
    /// at all, matching `cluster_manager.py::get_optimal_cluster`.
    pub fn optimal_for(&self, datacenter: Option<&str>, region: Option<&str>) -> Option<Cluster> {
        let guard = self.clusters.read();
        let active: Vec<&Cluster> = guard.values().filter(|c| c.status == ClusterStatus::Active).collect();

        if active.is_empty() {
            return None;
        }

        let by_datacenter: Vec<&&Cluster> = datacenter
            .map(|dc| active.iter().filter(|c| c.datacenter == dc).collect())
            .unwrap_or_default();

        if let Some(best) = by_datacenter.into_iter().min_by_key(|c| c.client_count) {
            return Some((*best).clone());
        }

        let by_region: Vec<&&Cluster> = region
            .map(|r| active.iter().filter(|c| c.region == r).collect())
            .unwrap_or_default();

        if let Some(best) = by_region.into_iter().min_by_key(|c| c.client_count) {
            return Some((*best).clone());
        }

        active.into_iter().min_by_key(|c| c.client_count).cloned()
    }

    pub fn get(&self, id: Uuid) -> Option<Cluster> {
        self.clusters.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Cluster> {
        self.clusters.read().values().cloned().collect()
    }

    fn mark_stale_if_overdue(&self, now: OffsetDateTime) {
        let mut guard = self.clusters.write();
        for cluster in guard.values_mut() {
            if cluster.status == ClusterStatus::Active && now - cluster.last_heartbeat > STALE_THRESHOLD {
                cluster.status = ClusterStatus::Stale;
            }
        }
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

pub fn verify_registration(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ControlPlaneError::validation("cluster name must not be empty"));
    }
    Ok(())
}

/// Background sweep demoting overdue-heartbeat clusters to `stale`, mirroring
/// `cluster_manager.py::_check_cluster_health`.
pub struct ClusterHealthMonitor {
    pub registry: std::sync::Arc<ClusterRegistry>,
}

#[async_trait]
impl Task for ClusterHealthMonitor {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "cluster health monitor";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_MONITOR_INTERVAL) => {}
                _ = shutdown_signal.wait() => break,
            }

            self.registry.mark_stale_if_overdue(OffsetDateTime::now_utc());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, dc: &str, region: &str) -> ClusterDescriptor {
        ClusterDescriptor {
            name: name.to_owned(),
            datacenter: dc.to_owned(),
            region: region.to_owned(),
            headend_url: format!("https://{name}.example.net"),
        }
    }

    #[test]
    fn register_then_authenticate_roundtrip() {
        let registry = ClusterRegistry::new();
        let (cluster, api_key) = registry.register(descriptor("edge-1", "dc1", "us-east"));

        let authenticated = registry.authenticate(&api_key).expect("authenticate");
        assert_eq!(authenticated.id, cluster.id);
    }

    #[test]
    fn wrong_api_key_does_not_authenticate() {
        let registry = ClusterRegistry::new();
        registry.register(descriptor("edge-1", "dc1", "us-east"));
        assert!(registry.authenticate("not-a-real-key").is_none());
    }

    #[test]
    fn optimal_for_prefers_exact_datacenter_then_fewest_clients() {
        let registry = ClusterRegistry::new();
        let (a, _) = registry.register(descriptor("a", "dc1", "us-east"));
        let (b, _) = registry.register(descriptor("b", "dc1", "us-east"));
        registry.heartbeat(a.id, Some(10));
        registry.heartbeat(b.id, Some(2));

        let chosen = registry.optimal_for(Some("dc1"), None).expect("some cluster");
        assert_eq!(chosen.id, b.id);
    }

    #[test]
    fn optimal_for_falls_back_to_region_then_any() {
        let registry = ClusterRegistry::new();
        let (a, _) = registry.register(descriptor("a", "dc9", "us-west"));
        registry.heartbeat(a.id, Some(0));

        let chosen = registry.optimal_for(Some("dc-missing"), Some("us-west")).expect("region match");
        assert_eq!(chosen.id, a.id);

        let chosen_any = registry.optimal_for(Some("dc-missing"), Some("eu-missing")).expect("any match");
        assert_eq!(chosen_any.id, a.id);
    }

    #[test]
    fn optimal_for_returns_none_when_nothing_active() {
        let registry = ClusterRegistry::new();
        assert!(registry.optimal_for(None, None).is_none());
    }

    #[test]
    fn stale_clusters_are_excluded_from_optimal_for() {
        let registry = ClusterRegistry::new();
        let (a, _) = registry.register(descriptor("a", "dc1", "us-east"));
        registry.clusters.write().get_mut(&a.id).unwrap().status = ClusterStatus::Stale;
        assert!(registry.optimal_for(Some("dc1"), None).is_none());
    }
}
