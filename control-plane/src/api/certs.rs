use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ApiResponse, Result};
use crate::extract::AdminScope;
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new().route("/generate", post(generate))
}

#[derive(Deserialize)]
struct GenerateRequest {
    node_id: String,
    name: String,
    node_type: String,
    #[serde(default)]
    sans: Vec<String>,
}

#[derive(Serialize)]
struct Certificates {
    key: String,
    cert: String,
    ca: String,
}

/// Standalone leaf-certificate issuance, for nodes that already enrolled
/// through `clusters::register`/`clients::register` but need an extra
/// certificate (e.g. after losing their original one). Admin-gated since it
/// bypasses the normal enrollment bookkeeping.
async fn generate(
    _scope: AdminScope,
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> Result<Json<ApiResponse<Certificates>>> {
    let issued = if body.node_type == "headend" {
        state.ca.issue_headend_cert(&body.node_id, &body.name, &body.sans)?
    } else {
        state.ca.issue_client_cert(&body.node_id, &body.name, &body.node_type)?
    };

    Ok(Json(ApiResponse::ok(Certificates {
        key: issued.key_pem,
        cert: issued.cert_pem,
        ca: issued.ca_pem,
    })))
}
