use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::ca::{OVERLAY_CIDR, WireGuardPeer};
use crate::error::{ApiResponse, ControlPlaneError, Result};
use crate::extract::{HeadendScope, WireGuardScope};
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new()
        .route("/keys", post(generate_keys))
        .route("/peers", get(list_peers))
}

#[derive(Deserialize)]
struct GenerateKeysRequest {
    node_id: String,
    name: String,
    node_type: String,
}

#[derive(Serialize)]
struct Certificates {
    key: String,
    cert: String,
    ca: String,
}

#[derive(Serialize)]
struct GenerateKeysResponse {
    peer: WireGuardPeer,
    private_key: String,
    network_cidr: String,
    certificates: Certificates,
}

/// Idempotent per `node_id`: a second call for the same node returns its
/// already-allocated peer instead of minting a new one (SPEC_FULL.md §4.1).
async fn generate_keys(
    _scope: WireGuardScope,
    State(state): State<AppState>,
    Json(body): Json<GenerateKeysRequest>,
) -> Result<Json<ApiResponse<GenerateKeysResponse>>> {
    let peer = state.ca.generate_wireguard_keys(&body.node_id, &body.node_type)?;
    let private_key = state
        .ca
        .wireguard_private_key(&body.node_id)
        .ok_or_else(|| ControlPlaneError::store("wireguard private key missing right after allocation"))?;

    let issued = if body.node_type == "headend" {
        state.ca.issue_headend_cert(&body.node_id, &body.name, &[])?
    } else {
        state.ca.issue_client_cert(&body.node_id, &body.name, &body.node_type)?
    };

    Ok(Json(ApiResponse::ok(GenerateKeysResponse {
        peer,
        private_key,
        network_cidr: OVERLAY_CIDR.to_owned(),
        certificates: Certificates {
            key: issued.key_pem,
            cert: issued.cert_pem,
            ca: issued.ca_pem,
        },
    })))
}

async fn list_peers(_scope: HeadendScope, State(state): State<AppState>) -> Json<ApiResponse<Vec<WireGuardPeer>>> {
    Json(ApiResponse::ok(state.ca.list_peers()))
}
