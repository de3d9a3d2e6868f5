//! On-disk configuration and the runtime handle wrapping it.
//!
//! `ConfFile` is the serde shape persisted to disk; `Conf` is the
//! validated, runtime-ready projection built from it. [`ConfHandle`] lets
//! every long-lived component hold a cheap `Arc` to whichever is current
//! and be notified when an administrator pushes a reload.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub mod dto {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum VerbosityProfile {
        Default,
        Quiet,
        Verbose,
        Debug,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum CaKeySource {
        Generate,
        FromFile { key_path: String, cert_path: String },
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FeedSourceConf {
        pub name: String,
        pub kind: String,
        pub url: String,
        pub shape: String,
        pub confidence: u8,
        pub interval_secs: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RateLimitRuleConf {
        pub name: String,
        pub priority: i64,
        pub max_requests: u64,
        pub window_secs: u64,
        pub block_duration_secs: u64,
        pub endpoints: Option<Vec<String>>,
        pub exempt_ips: Vec<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConfFile {
        pub listen_address: String,
        pub data_dir: String,
        pub overlay_cidr: String,
        pub ca_key_source: CaKeySource,
        pub access_token_lifetime_hours: u64,
        pub refresh_token_lifetime_days: u64,
        pub redis_url: Option<String>,
        pub rate_limit_rules: Vec<RateLimitRuleConf>,
        pub feed_sources: Vec<FeedSourceConf>,
        pub log_file: String,
        pub verbosity_profile: VerbosityProfile,
        pub ipam_reuse_grace_hours: u64,
        pub rotate_key_grace_seconds: Option<u64>,
    }

    impl Default for ConfFile {
        fn default() -> Self {
            Self {
                listen_address: "0.0.0.0:8443".to_owned(),
                data_dir: "/var/lib/control-plane".to_owned(),
                overlay_cidr: "10.200.0.0/16".to_owned(),
                ca_key_source: CaKeySource::Generate,
                access_token_lifetime_hours: 24,
                refresh_token_lifetime_days: 7,
                redis_url: None,
                rate_limit_rules: Vec::new(),
                feed_sources: Vec::new(),
                log_file: "control-plane.log".to_owned(),
                verbosity_profile: VerbosityProfile::Default,
                ipam_reuse_grace_hours: 24,
                rotate_key_grace_seconds: None,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub listen_address: SocketAddr,
    pub data_dir: Utf8PathBuf,
    pub overlay_cidr: String,
    pub ca_key_source: dto::CaKeySource,
    pub access_token_lifetime: time::Duration,
    pub refresh_token_lifetime: time::Duration,
    pub redis_url: Option<String>,
    pub rate_limit_rules: Vec<dto::RateLimitRuleConf>,
    pub feed_sources: Vec<dto::FeedSourceConf>,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub ipam_reuse_grace: time::Duration,
    pub rotate_key_grace_seconds: Option<u64>,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        Ok(Self {
            listen_address: conf_file
                .listen_address
                .parse()
                .context("invalid listen_address")?,
            data_dir: Utf8PathBuf::from(&conf_file.data_dir),
            overlay_cidr: conf_file.overlay_cidr.clone(),
            ca_key_source: conf_file.ca_key_source.clone(),
            access_token_lifetime: time::Duration::hours(conf_file.access_token_lifetime_hours as i64),
            refresh_token_lifetime: time::Duration::days(conf_file.refresh_token_lifetime_days as i64),
            redis_url: conf_file.redis_url.clone(),
            rate_limit_rules: conf_file.rate_limit_rules.clone(),
            feed_sources: conf_file.feed_sources.clone(),
            log_file: Utf8PathBuf::from(&conf_file.log_file),
            verbosity_profile: conf_file.verbosity_profile.clone(),
            ipam_reuse_grace: time::Duration::hours(conf_file.ipam_reuse_grace_hours as i64),
            rotate_key_grace_seconds: conf_file.rotate_key_grace_seconds,
        })
    }
}

struct ConfHandleInner {
    conf: RwLock<Arc<Conf>>,
    conf_file: RwLock<Arc<dto::ConfFile>>,
    changed: Notify,
}

#[derive(Clone)]
pub struct ConfHandle(Arc<ConfHandleInner>);

impl ConfHandle {
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file)?;

        Ok(Self(Arc::new(ConfHandleInner {
            conf: RwLock::new(Arc::new(conf)),
            conf_file: RwLock::new(Arc::new(conf_file)),
            changed: Notify::new(),
        })))
    }

    /// Builds a handle directly from an in-memory `ConfFile`, for tests.
    pub fn mock(conf_file: dto::ConfFile) -> anyhow::Result<Self> {
        let conf = Conf::from_conf_file(&conf_file)?;

        Ok(Self(Arc::new(ConfHandleInner {
            conf: RwLock::new(Arc::new(conf)),
            conf_file: RwLock::new(Arc::new(conf_file)),
            changed: Notify::new(),
        })))
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        self.0.conf.read().clone()
    }

    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.0.conf_file.read().clone()
    }

    pub async fn change_notified(&self) {
        self.0.changed.notified().await;
    }

    /// Re-validates, persists to disk, and atomically swaps both layers,
    /// waking every waiter registered via [`Self::change_notified`].
    pub fn save_new_conf_file(&self, new_conf_file: dto::ConfFile) -> anyhow::Result<()> {
        let new_conf = Conf::from_conf_file(&new_conf_file).context("new configuration failed validation")?;

        let path = conf_file_path(&new_conf.data_dir);
        let json = serde_json::to_string_pretty(&new_conf_file).context("failed to serialize configuration")?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {path}"))?;

        *self.0.conf.write() = Arc::new(new_conf);
        *self.0.conf_file.write() = Arc::new(new_conf_file);
        self.0.changed.notify_waiters();

        Ok(())
    }
}

fn conf_file_path(data_dir: &Utf8PathBuf) -> Utf8PathBuf {
    data_dir.join("control-plane.json")
}

fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let data_dir = std::env::var("CONTROL_PLANE_DATA_DIR").unwrap_or_else(|_| "/var/lib/control-plane".to_owned());
    let path = conf_file_path(&Utf8PathBuf::from(&data_dir));

    if let Ok(contents) = std::fs::read_to_string(&path) {
        return serde_json::from_str(&contents).with_context(|| format!("failed to parse {path}"));
    }

    let mut conf_file = dto::ConfFile::default();
    conf_file.data_dir = data_dir;

    std::fs::create_dir_all(&conf_file.data_dir).context("failed to create data directory")?;
    let json = serde_json::to_string_pretty(&conf_file)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write default configuration to {path}"))?;

    Ok(conf_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_handle_round_trips_defaults() {
        let handle = ConfHandle::mock(dto::ConfFile::default()).expect("mock handle");
        let conf = handle.get_conf();
        assert_eq!(conf.overlay_cidr, "10.200.0.0/16");
    }

    #[test]
    fn save_new_conf_file_rejects_invalid_listen_address() {
        let handle = ConfHandle::mock(dto::ConfFile::default()).expect("mock handle");
        let mut bad = (*handle.get_conf_file()).clone();
        bad.listen_address = "not-an-address".to_owned();
        assert!(handle.save_new_conf_file(bad).is_err());
    }
}
