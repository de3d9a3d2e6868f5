//! Threat-feed ingestion and indicator lookup.
//!
//! Sources are line-oriented lists (domains or IP/CIDR), fetched on their
//! own interval and upserted into a shared indicator table keyed on
//! `(value, source)`. Lookups additionally walk parent domains and CIDR
//! containment, so a single ingested `/24` or apex domain covers every
//! address or subdomain underneath it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use control_plane_task::{ShutdownSignal, Task};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const FETCH_TIMEOUT: StdDuration = StdDuration::from_secs(5 * 60);
const LOOKUP_CACHE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSourceKind {
    AbuseCh,
    AlienVaultOtx,
    EmergingThreats,
    Spamhaus,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    DomainList,
    IpCidrList,
}

#[derive(Debug, Clone)]
pub struct FeedSource {
    pub name: String,
    pub kind: FeedSourceKind,
    pub url: String,
    pub shape: PayloadShape,
    pub confidence: u8,
    pub update_interval: StdDuration,
}

impl FeedSource {
    pub fn custom(name: impl Into<String>, url: impl Into<String>, shape: PayloadShape, confidence: u8) -> Self {
        Self {
            name: name.into(),
            kind: FeedSourceKind::Custom,
            url: url.into(),
            shape,
            confidence,
            update_interval: StdDuration::from_secs(45 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    Domain,
    Ip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub value: String,
    pub indicator_type: IndicatorType,
    pub threat_types: Vec<String>,
    pub source: String,
    pub confidence: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub ttl: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedUpdateStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedUpdate {
    pub id: Uuid,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub status: FeedUpdateStatus,
    pub added: u64,
    pub updated: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorMatch {
    pub source: String,
    pub confidence: u8,
    pub threat_types: Vec<String>,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    ParentDomain,
    NetworkRange,
}

struct LookupCacheEntry {
    result: Vec<IndicatorMatch>,
    expires_at: OffsetDateTime,
}

pub struct ThreatFeedStore {
    sources: Vec<FeedSource>,
    // keyed on (value, source) to honor uniqueness per §3.
    indicators: RwLock<HashMap<(String, String), ThreatIndicator>>,
    updates: RwLock<Vec<FeedUpdate>>,
    lookup_cache: RwLock<HashMap<String, LookupCacheEntry>>,
    http: reqwest::Client,
}

impl ThreatFeedStore {
    pub fn new(sources: Vec<FeedSource>) -> Self {
        Self {
            sources,
            indicators: RwLock::new(HashMap::new()),
            updates: RwLock::new(Vec::new()),
            lookup_cache: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client configuration is static and valid"),
        }
    }

    pub fn sources(&self) -> &[FeedSource] {
        &self.sources
    }

    pub fn recent_updates(&self, source: Option<&str>) -> Vec<FeedUpdate> {
        let guard = self.updates.read();
        match source {
            Some(s) => guard.iter().filter(|u| u.source == s).cloned().collect(),
            None => guard.clone(),
        }
    }

    pub async fn ingest_once(&self, source: &FeedSource) {
        let mut update = FeedUpdate {
            id: Uuid::new_v4(),
            source: source.name.clone(),
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            status: FeedUpdateStatus::Pending,
            added: 0,
            updated: 0,
            error: None,
        };
        self.updates.write().push(update.clone());

        match self.fetch_and_upsert(source).await {
            Ok((added, updated)) => {
                update.added = added;
                update.updated = updated;
                update.status = FeedUpdateStatus::Completed;
                tracing::info!(source = %source.name, added, updated, "feed ingestion completed");
            }
            Err(e) => {
                update.status = FeedUpdateStatus::Failed;
                update.error = Some(e.to_string());
                tracing::error!(source = %source.name, error = %e, "feed ingestion failed");
            }
        }
        update.finished_at = Some(OffsetDateTime::now_utc());

        let mut guard = self.updates.write();
        if let Some(slot) = guard.iter_mut().find(|u| u.id == update.id) {
            *slot = update;
        }
    }

    async fn fetch_and_upsert(&self, source: &FeedSource) -> anyhow::Result<(u64, u64)> {
        let body = self.http.get(&source.url).send().await?.error_for_status()?.text().await?;

        let mut added = 0u64;
        let mut updated = 0u64;
        let now = OffsetDateTime::now_utc();

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') || line.starts_with('!') {
                continue;
            }

            let Some((value, indicator_type)) = validate_entry(line, source.shape) else {
                continue;
            };

            let key = (value.clone(), source.name.clone());
            let mut guard = self.indicators.write();
            match guard.get_mut(&key) {
                Some(existing) => {
                    existing.last_seen = now;
                    existing.confidence = source.confidence;
                    existing.ttl = source.update_interval.as_secs() as i64 * 2;
                    updated += 1;
                }
                None => {
                    guard.insert(
                        key,
                        ThreatIndicator {
                            value,
                            indicator_type,
                            threat_types: vec![source.kind_label()],
                            source: source.name.clone(),
                            confidence: source.confidence,
                            first_seen: now,
                            last_seen: now,
                            ttl: source.update_interval.as_secs() as i64 * 2,
                            active: true,
                        },
                    );
                    added += 1;
                }
            }
        }

        Ok((added, updated))
    }

    /// §4.7 lookup: exact match, then parent-domain widening for domains,
    /// then CIDR containment for IPs. Results (including negatives) are
    /// memoized for a short TTL to amortize hot-path lookups.
    pub fn check(&self, value: &str) -> (bool, Vec<IndicatorMatch>) {
        if let Some(cached) = self.cached(value) {
            return (!cached.is_empty(), cached);
        }

        let mut matches = Vec::new();
        let guard = self.indicators.read();
        let is_ip = value.parse::<IpAddr>().is_ok();

        for indicator in guard.values().filter(|i| i.active) {
            if indicator.value == value {
                matches.push(IndicatorMatch {
                    source: indicator.source.clone(),
                    confidence: indicator.confidence,
                    threat_types: indicator.threat_types.clone(),
                    match_type: MatchType::Exact,
                });
                continue;
            }

            if !is_ip && value.contains('.') && indicator.indicator_type == IndicatorType::Domain {
                if is_parent_domain(&indicator.value, value) {
                    matches.push(IndicatorMatch {
                        source: indicator.source.clone(),
                        confidence: indicator.confidence.saturating_sub(10),
                        threat_types: indicator.threat_types.clone(),
                        match_type: MatchType::ParentDomain,
                    });
                }
            }

            if is_ip && indicator.value.contains('/') {
                if let (Ok(network), Ok(addr)) = (indicator.value.parse::<IpNetwork>(), value.parse::<IpAddr>()) {
                    if network.contains(addr) {
                        matches.push(IndicatorMatch {
                            source: indicator.source.clone(),
                            confidence: indicator.confidence,
                            threat_types: indicator.threat_types.clone(),
                            match_type: MatchType::NetworkRange,
                        });
                    }
                }
            }
        }
        drop(guard);

        self.lookup_cache.write().insert(
            value.to_owned(),
            LookupCacheEntry {
                result: matches.clone(),
                expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(LOOKUP_CACHE_TTL_SECS),
            },
        );

        (!matches.is_empty(), matches)
    }

    fn cached(&self, value: &str) -> Option<Vec<IndicatorMatch>> {
        let guard = self.lookup_cache.read();
        let entry = guard.get(value)?;
        if entry.expires_at > OffsetDateTime::now_utc() {
            Some(entry.result.clone())
        } else {
            None
        }
    }
}

impl FeedSource {
    fn kind_label(&self) -> String {
        match self.kind {
            FeedSourceKind::AbuseCh => "abuse_ch",
            FeedSourceKind::AlienVaultOtx => "alienvault_otx",
            FeedSourceKind::EmergingThreats => "emerging_threats",
            FeedSourceKind::Spamhaus => "spamhaus",
            FeedSourceKind::Custom => "custom",
        }
        .to_owned()
    }
}

fn validate_entry(line: &str, shape: PayloadShape) -> Option<(String, IndicatorType)> {
    match shape {
        PayloadShape::IpCidrList => {
            if line.parse::<IpNetwork>().is_ok() || line.parse::<IpAddr>().is_ok() {
                Some((line.to_owned(), IndicatorType::Ip))
            } else {
                None
            }
        }
        PayloadShape::DomainList => {
            let lower = line.to_lowercase();
            if lower.contains('.') && lower.len() > 3 && !lower.contains(' ') {
                Some((lower, IndicatorType::Domain))
            } else {
                None
            }
        }
    }
}

fn is_parent_domain(indicator_domain: &str, queried: &str) -> bool {
    queried.ends_with(&format!(".{indicator_domain}"))
}

/// One background ingestion loop per source, each on its own interval.
pub struct FeedIngestionTask {
    pub store: Arc<ThreatFeedStore>,
    pub source: FeedSource,
}

#[async_trait]
impl Task for FeedIngestionTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "threat feed ingestion";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            self.store.ingest_once(&self.source).await;

            tokio::select! {
                _ = tokio::time::sleep(self.source.update_interval) => {}
                _ = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_indicator(value: &str, indicator_type: IndicatorType) -> ThreatFeedStore {
        let store = ThreatFeedStore::new(vec![]);
        store.indicators.write().insert(
            (value.to_owned(), "test".to_owned()),
            ThreatIndicator {
                value: value.to_owned(),
                indicator_type,
                threat_types: vec!["malware".into()],
                source: "test".into(),
                confidence: 80,
                first_seen: OffsetDateTime::now_utc(),
                last_seen: OffsetDateTime::now_utc(),
                ttl: 3600,
                active: true,
            },
        );
        store
    }

    #[test]
    fn exact_domain_match_is_detected() {
        let store = store_with_indicator("evil.example", IndicatorType::Domain);
        let (is_threat, matches) = store.check("evil.example");
        assert!(is_threat);
        assert_eq!(matches[0].match_type, MatchType::Exact);
    }

    #[test]
    fn parent_domain_match_reduces_confidence() {
        let store = store_with_indicator("evil.example", IndicatorType::Domain);
        let (is_threat, matches) = store.check("sub.evil.example");
        assert!(is_threat);
        assert_eq!(matches[0].match_type, MatchType::ParentDomain);
        assert_eq!(matches[0].confidence, 70);
    }

    #[test]
    fn cidr_match_detects_ip_in_network() {
        let store = store_with_indicator("203.0.113.0/24", IndicatorType::Ip);
        let (is_threat, matches) = store.check("203.0.113.50");
        assert!(is_threat);
        assert_eq!(matches[0].match_type, MatchType::NetworkRange);
    }

    #[test]
    fn unrelated_value_is_not_a_threat() {
        let store = store_with_indicator("evil.example", IndicatorType::Domain);
        let (is_threat, matches) = store.check("benign.example");
        assert!(!is_threat);
        assert!(matches.is_empty());
    }

    #[test]
    fn validate_entry_rejects_garbage_domain_lines() {
        assert!(validate_entry("not a domain", PayloadShape::DomainList).is_none());
        assert!(validate_entry("example.com", PayloadShape::DomainList).is_some());
    }

    #[test]
    fn validate_entry_rejects_unparseable_ip_lines() {
        assert!(validate_entry("definitely-not-an-ip", PayloadShape::IpCidrList).is_none());
        assert!(validate_entry("198.51.100.0/24", PayloadShape::IpCidrList).is_some());
    }
}
