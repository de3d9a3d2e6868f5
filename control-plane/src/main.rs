#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::sync::Arc;

use anyhow::Context as _;
use control_plane::api;
use control_plane::ca::CertificateAuthority;
use control_plane::clients::{ClientCleanupTask, ClientRegistry, ClientRegistryConfig};
use control_plane::clusters::{ClusterHealthMonitor, ClusterRegistry};
use control_plane::config::dto::{FeedSourceConf, RateLimitRuleConf};
use control_plane::config::ConfHandle;
use control_plane::feeds::{FeedIngestionTask, FeedSource, FeedSourceKind, PayloadShape, ThreatFeedStore};
use control_plane::guard::{GuardSweepTask, RateLimitRule, RequestGuard};
use control_plane::log::ControlPlaneLog;
use control_plane::memory_cache::InProcessTokenCache;
use control_plane::middleware;
use control_plane::policy::PolicyStore;
use control_plane::redis_backend::RedisTokenCache;
use control_plane::rule_cache::RuleCache;
use control_plane::state::AppState;
use control_plane::token::{TokenCleanupTask, TokenService, TokenServiceConfig};
use control_plane_task::{ChildTask, ShutdownHandle, ShutdownSignal, spawn_task};

fn main() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard =
        control_plane_log::init::<ControlPlaneLog>(&conf.log_file, "info", std::env::var("CONTROL_PLANE_LOG").ok().as_deref())
            .context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let (state, tasks) = runtime.block_on(build(conf_handle, shutdown_signal))?;

    runtime.block_on(serve(state, tasks, shutdown_handle))
}

/// Wires every component together in dependency order and registers the
/// background tasks each one needs, mirroring the teacher's
/// `GatewayService::spawn_tasks`.
async fn build(conf_handle: ConfHandle, shutdown_signal: ShutdownSignal) -> anyhow::Result<(AppState, Vec<ChildTask<anyhow::Result<()>>>)> {
    let conf = conf_handle.get_conf();
    let mut tasks = Vec::new();

    let ca = Arc::new(
        CertificateAuthority::bootstrap(conf.ipam_reuse_grace, &conf.ca_key_source)
            .context("failed to bootstrap certificate authority")?,
    );

    let clusters = Arc::new(ClusterRegistry::new());
    tasks.push(spawn_task(
        ClusterHealthMonitor { registry: clusters.clone() },
        shutdown_signal.clone(),
    ));

    let clients = Arc::new(ClientRegistry::new(
        clusters.clone(),
        ClientRegistryConfig {
            rotate_key_grace_seconds: conf.rotate_key_grace_seconds,
        },
    ));
    tasks.push(spawn_task(
        ClientCleanupTask { registry: clients.clone() },
        shutdown_signal.clone(),
    ));

    let token_cache = match &conf.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("invalid redis_url")?;
            RedisTokenCache::new(client)
        }
        None => {
            warn!("no redis_url configured; token cache is in-process and won't survive a restart");
            InProcessTokenCache::new()
        }
    };
    let tokens = Arc::new(
        TokenService::generate_keypair(
            token_cache.clone(),
            TokenServiceConfig {
                access_lifetime_secs: conf.access_token_lifetime.whole_seconds(),
                refresh_lifetime_secs: conf.refresh_token_lifetime.whole_seconds(),
                fail_open_on_issuance: false,
            },
        )
        .context("failed to generate token signing key")?,
    );
    tasks.push(spawn_task(TokenCleanupTask { cache: token_cache }, shutdown_signal.clone()));

    let policy = Arc::new(PolicyStore::new());

    let redis_client = conf
        .redis_url
        .as_ref()
        .map(|url| redis::Client::open(url.as_str()))
        .transpose()
        .context("invalid redis_url")?;
    let rule_cache = Arc::new(RuleCache::new(redis_client.clone(), policy.clone()));

    let feeds = Arc::new(ThreatFeedStore::new(
        conf.feed_sources.iter().map(build_feed_source).collect::<anyhow::Result<Vec<_>>>()?,
    ));
    for source in feeds.sources() {
        tasks.push(spawn_task(
            FeedIngestionTask {
                store: feeds.clone(),
                source: source.clone(),
            },
            shutdown_signal.clone(),
        ));
    }

    let rules = conf
        .rate_limit_rules
        .iter()
        .map(build_rate_limit_rule)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let guard = Arc::new(RequestGuard::new(rules));
    tasks.push(spawn_task(GuardSweepTask { guard: guard.clone() }, shutdown_signal.clone()));

    tasks.push(spawn_task(
        control_plane_log::LogDeleterTask::<ControlPlaneLog>::new(conf.log_file.clone()),
        shutdown_signal.clone(),
    ));

    let state = AppState {
        conf_handle,
        ca,
        clusters,
        clients,
        tokens,
        policy,
        rule_cache,
        feeds,
        guard,
    };

    Ok((state, tasks))
}

fn build_feed_source(conf: &FeedSourceConf) -> anyhow::Result<FeedSource> {
    let kind: FeedSourceKind =
        serde_json::from_value(serde_json::Value::String(conf.kind.clone())).with_context(|| format!("unknown feed kind `{}`", conf.kind))?;
    let shape: PayloadShape =
        serde_json::from_value(serde_json::Value::String(conf.shape.clone())).with_context(|| format!("unknown feed shape `{}`", conf.shape))?;

    Ok(FeedSource {
        name: conf.name.clone(),
        kind,
        url: conf.url.clone(),
        shape,
        confidence: conf.confidence,
        update_interval: std::time::Duration::from_secs(conf.interval_secs),
    })
}

fn build_rate_limit_rule(conf: &RateLimitRuleConf) -> anyhow::Result<RateLimitRule> {
    let exempt_ips = conf
        .exempt_ips
        .iter()
        .map(|s| s.parse::<std::net::IpAddr>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid exempt IP in rate limit rule `{}`", conf.name))?;

    Ok(RateLimitRule {
        name: conf.name.clone(),
        priority: conf.priority,
        max_requests: conf.max_requests,
        window: std::time::Duration::from_secs(conf.window_secs),
        block_duration: std::time::Duration::from_secs(conf.block_duration_secs),
        endpoints: conf.endpoints.clone(),
        exempt_ips,
    })
}

async fn serve(state: AppState, tasks: Vec<ChildTask<anyhow::Result<()>>>, shutdown_handle: ShutdownHandle) -> anyhow::Result<()> {
    let listen_address = state.conf_handle.get_conf().listen_address;

    let app = api::make_router(state.clone())
        .layer(axum::middleware::from_fn_with_state(state.guard.clone(), middleware::guard::guard_middleware))
        .layer(axum::middleware::from_fn(middleware::log::log_middleware))
        .layer(middleware::cors::make_middleware());

    let listener = tokio::net::TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("failed to bind {listen_address}"))?;

    info!(%listen_address, "control plane listening");

    let serve_fut = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>());

    tokio::select! {
        result = serve_fut => {
            result.context("server task failed")?;
        }
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    shutdown_handle.signal();

    let all_closed = shutdown_handle.all_closed();
    tokio::select! {
        _ = all_closed => {}
        _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
            warn!("not every background task stopped within the grace period");
        }
    }

    drop(tasks);

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")
}
