use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiResponse, ControlPlaneError, Result};
use crate::extract::{AdminScope, BearerClaims};
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new()
        .route("/token", post(issue_token))
        .route("/refresh", post(refresh))
        .route("/validate", post(validate))
        .route("/revoke", post(revoke))
        .route("/public-key", get(public_key))
}

#[derive(Deserialize)]
struct TokenRequest {
    api_key: String,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

/// A node's very first token is minted from the enrollment API key it
/// already holds, not from a caller-supplied permission list — the
/// permission set is derived server-side from what kind of node
/// authenticated, so a compromised client can't self-grant `headend`
/// permissions. (Open question resolved this way; `original_source` left
/// this implicit since its JWT manager trusted whatever the caller passed.)
async fn issue_token(State(state): State<AppState>, Json(body): Json<TokenRequest>) -> Result<Json<ApiResponse<TokenResponse>>> {
    let (node_id, node_type, permissions) = if let Some(cluster) = state.clusters.authenticate(&body.api_key) {
        (
            cluster.id.to_string(),
            "headend".to_owned(),
            vec![
                "headend".to_owned(),
                "proxy".to_owned(),
                "wireguard".to_owned(),
                "mirror_traffic".to_owned(),
            ],
        )
    } else if let Some(client) = state.clients.authenticate(&body.api_key) {
        (
            client.id.to_string(),
            client.node_type.clone(),
            vec!["connect".to_owned(), "tunnel".to_owned(), "route".to_owned()],
        )
    } else {
        return Err(ControlPlaneError::authentication("unrecognized API key"));
    };

    let issued = state.tokens.generate(&node_id, &node_type, permissions, None).await?;

    Ok(Json(ApiResponse::ok(TokenResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        expires_at: issued.expires_at,
    })))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshRequest>) -> Result<Json<ApiResponse<TokenResponse>>> {
    let issued = state.tokens.refresh(&body.refresh_token).await?;

    Ok(Json(ApiResponse::ok(TokenResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        expires_at: issued.expires_at,
    })))
}

#[derive(Serialize)]
struct ValidateResponse {
    valid: bool,
    sub: String,
    node_type: String,
    permissions: Vec<String>,
    metadata: Option<serde_json::Value>,
    exp: i64,
}

async fn validate(BearerClaims(claims): BearerClaims) -> Json<ApiResponse<ValidateResponse>> {
    Json(ApiResponse::ok(ValidateResponse {
        valid: true,
        sub: claims.sub,
        node_type: claims.node_type,
        permissions: claims.permissions,
        metadata: claims.metadata,
        exp: claims.exp,
    }))
}

#[derive(Deserialize)]
struct RevokeRequest {
    node_id: Option<String>,
    jti: Option<Uuid>,
}

#[derive(Serialize)]
struct RevokeResponse {
    revoked: u64,
}

async fn revoke(
    _scope: AdminScope,
    State(state): State<AppState>,
    Json(body): Json<RevokeRequest>,
) -> Result<Json<ApiResponse<RevokeResponse>>> {
    let revoked = match (body.node_id, body.jti) {
        (Some(node_id), _) => {
            // Revoking a node's tokens also reclaims its overlay address:
            // the IPAM grace period (§4.1) is what keeps the address from
            // being handed to someone else before the node is truly gone.
            state.ca.revoke_wireguard_keys(&node_id);
            state.tokens.revoke_all(&node_id).await? as u64
        }
        (None, Some(jti)) => u64::from(state.tokens.revoke(jti).await?),
        (None, None) => return Err(ControlPlaneError::validation("revoke requires node_id or jti")),
    };

    Ok(Json(ApiResponse::ok(RevokeResponse { revoked })))
}

#[derive(Serialize)]
struct PublicKeyResponse {
    public_key: String,
    algorithm: &'static str,
    #[serde(rename = "use")]
    key_use: &'static str,
}

async fn public_key(State(state): State<AppState>) -> Result<Json<ApiResponse<PublicKeyResponse>>> {
    Ok(Json(ApiResponse::ok(PublicKeyResponse {
        public_key: state.tokens.public_key_pem()?,
        algorithm: "RS256",
        key_use: "sig",
    })))
}
