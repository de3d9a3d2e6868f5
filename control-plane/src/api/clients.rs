use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::{ClientDescriptor, ClientStatus};
use crate::error::{ApiResponse, ControlPlaneError, Result};
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/{id}/config", get(get_config))
        .route("/{id}/rotate-key", post(rotate_key))
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    #[serde(rename = "type")]
    node_type: String,
    public_key: Option<String>,
    location: Option<String>,
}

#[derive(Serialize)]
struct Certificates {
    key: String,
    cert: String,
    ca: String,
}

#[derive(Serialize)]
struct ClusterBinding {
    id: Uuid,
    headend_url: Option<String>,
}

#[derive(Serialize)]
struct RegisterResponse {
    client_id: Uuid,
    api_key: String,
    cluster: ClusterBinding,
    certificates: Certificates,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<ApiResponse<RegisterResponse>>> {
    let (client, api_key) = state.clients.register(ClientDescriptor {
        node_type: body.node_type.clone(),
        name: body.name.clone(),
        preferred_datacenter: body.location.clone(),
        preferred_region: None,
        public_key: body.public_key,
    })?;

    let issued = state.ca.issue_client_cert(&client.id.to_string(), &body.name, &body.node_type)?;
    let headend_url = state.clusters.get(client.cluster_id).map(|c| c.headend_url);

    Ok(Json(ApiResponse::ok(RegisterResponse {
        client_id: client.id,
        api_key,
        cluster: ClusterBinding {
            id: client.cluster_id,
            headend_url,
        },
        certificates: Certificates {
            key: issued.key_pem,
            cert: issued.cert_pem,
            ca: issued.ca_pem,
        },
    })))
}

#[derive(Serialize)]
struct ConfigResponse {
    client_id: Uuid,
    cluster_id: Uuid,
    status: ClientStatus,
}

/// Bearer here is the client's own API key; it both authenticates the
/// caller and is the subject of the response.
async fn get_config(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<ApiResponse<ConfigResponse>>> {
    let client = state
        .clients
        .authenticate(bearer.token())
        .ok_or_else(|| ControlPlaneError::authentication("invalid client API key"))?;

    if client.id != id {
        return Err(ControlPlaneError::authorization("API key does not belong to this client"));
    }

    Ok(Json(ApiResponse::ok(ConfigResponse {
        client_id: client.id,
        cluster_id: client.cluster_id,
        status: client.status,
    })))
}

#[derive(Serialize)]
struct RotateKeyResponse {
    new_api_key: String,
}

async fn rotate_key(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ApiResponse<RotateKeyResponse>>> {
    let new_api_key = state
        .clients
        .rotate_api_key(id)
        .ok_or_else(|| ControlPlaneError::not_found("client not found"))?;

    Ok(Json(ApiResponse::ok(RotateKeyResponse { new_api_key })))
}
