use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ApiResponse;
use crate::extract::HeadendScope;
use crate::feeds::IndicatorMatch;
use crate::policy::RuleBundle;
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new()
        .route("/rules", get(all_rules))
        .route("/user/{id}/rules", get(user_rules))
        .route("/feeds/check", post(check_indicator))
}

#[derive(Serialize)]
struct AllRulesResponse {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    rules_count: usize,
    user_rules: HashMap<String, RuleBundle>,
}

async fn all_rules(_scope: HeadendScope, State(state): State<AppState>) -> Json<ApiResponse<AllRulesResponse>> {
    let rules_count = state.policy.get_all().values().map(Vec::len).sum();
    let user_rules = state.rule_cache.get_all_bundle().await;

    Json(ApiResponse::ok(AllRulesResponse {
        timestamp: OffsetDateTime::now_utc(),
        rules_count,
        user_rules,
    }))
}

async fn user_rules(_scope: HeadendScope, State(state): State<AppState>, Path(id): Path<String>) -> Json<ApiResponse<RuleBundle>> {
    Json(ApiResponse::ok(state.rule_cache.get_user_bundle(&id).await))
}

#[derive(Deserialize)]
struct CheckIndicatorRequest {
    value: String,
}

#[derive(Serialize)]
struct CheckIndicatorResponse {
    value: String,
    is_threat: bool,
    threat_details: Vec<IndicatorMatch>,
}

/// Dropped from the external interface list during distillation but present
/// in `original_source/manager/api/security_scanner_routes.py::check_threat_indicator`
/// — a headend asks this before trusting a destination a client wants to
/// reach, so it's supplemented back in here.
async fn check_indicator(
    _scope: HeadendScope,
    State(state): State<AppState>,
    Json(body): Json<CheckIndicatorRequest>,
) -> Json<ApiResponse<CheckIndicatorResponse>> {
    let (is_threat, threat_details) = state.feeds.check(&body.value);

    Json(ApiResponse::ok(CheckIndicatorResponse {
        value: body.value,
        is_threat,
        threat_details,
    }))
}
