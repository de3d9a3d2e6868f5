use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub(crate) struct Health {
    status: &'static str,
    version: &'static str,
    active_clusters: usize,
    active_clients: usize,
}

/// Performs a health check. Unauthenticated; only subject to the request
/// guard if an admin configures a rate-limit rule with no `endpoints`
/// filter (the default rule set is empty, so orchestrators can poll it
/// freely out of the box).
pub(super) async fn get_health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_clusters: state.clusters.list().len(),
        active_clients: state.clients.list().len(),
    })
}
