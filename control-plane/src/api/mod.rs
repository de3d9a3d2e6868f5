pub mod admin;
pub mod auth;
pub mod certs;
pub mod clients;
pub mod clusters;
pub mod config;
pub mod firewall;
pub mod health;
pub mod wireguard;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::get_health))
        .nest("/api/v1/config", config::make_router())
        .nest("/api/v1/clusters", clusters::make_router())
        .nest("/api/v1/clients", clients::make_router())
        .nest("/api/v1/certs", certs::make_router())
        .nest("/api/v1/wireguard", wireguard::make_router())
        .nest("/api/v1/auth", auth::make_router())
        .nest("/api/v1/firewall", firewall::make_router())
        .nest("/api/v1/admin", admin::make_router())
        .with_state(state)
}
