use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clusters::{ClusterDescriptor, verify_registration};
use crate::error::{ApiResponse, ControlPlaneError, Result};
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/{id}/heartbeat", post(heartbeat))
        .route("/{id}/headend-config", get(headend_config))
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    region: String,
    datacenter: String,
    headend_url: String,
}

#[derive(Serialize)]
struct Certificates {
    key: String,
    cert: String,
    ca: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    cluster_id: Uuid,
    api_key: String,
    certificates: Certificates,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<ApiResponse<RegisterResponse>>> {
    verify_registration(&body.name)?;

    let (cluster, api_key) = state.clusters.register(ClusterDescriptor {
        name: body.name,
        datacenter: body.datacenter,
        region: body.region,
        headend_url: body.headend_url,
    });

    let issued = state
        .ca
        .issue_headend_cert(&cluster.id.to_string(), &cluster.name, &[cluster.headend_url.clone()])?;

    Ok(Json(ApiResponse::ok(RegisterResponse {
        cluster_id: cluster.id,
        api_key,
        certificates: Certificates {
            key: issued.key_pem,
            cert: issued.cert_pem,
            ca: issued.ca_pem,
        },
    })))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    client_count: Option<u64>,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<ApiResponse<()>>> {
    if state.clusters.heartbeat(id, body.client_count) {
        Ok(Json(ApiResponse::ok(())))
    } else {
        Err(ControlPlaneError::not_found("cluster not found"))
    }
}

#[derive(Serialize)]
struct HeadendConfigResponse {
    cluster_id: Uuid,
    auth: AuthConfig,
    wireguard: WireGuardConfig,
}

#[derive(Serialize)]
struct AuthConfig {
    public_key: String,
    algorithm: &'static str,
}

#[derive(Serialize)]
struct WireGuardConfig {
    overlay_cidr: String,
    peers: Vec<crate::ca::WireGuardPeer>,
}

/// Bearer here is the cluster's own API key, not a JWT — the cluster
/// authenticates itself the same way as at registration.
async fn headend_config(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<ApiResponse<HeadendConfigResponse>>> {
    let cluster = state
        .clusters
        .authenticate(bearer.token())
        .ok_or_else(|| ControlPlaneError::authentication("invalid cluster API key"))?;

    if cluster.id != id {
        return Err(ControlPlaneError::authorization("API key does not belong to this cluster"));
    }

    let conf = state.conf_handle.get_conf();

    Ok(Json(ApiResponse::ok(HeadendConfigResponse {
        cluster_id: cluster.id,
        auth: AuthConfig {
            public_key: state.tokens.public_key_pem()?,
            algorithm: "RS256",
        },
        wireguard: WireGuardConfig {
            overlay_cidr: conf.overlay_cidr.clone(),
            peers: state.ca.list_peers(),
        },
    })))
}
