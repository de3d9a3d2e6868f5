use std::net::IpAddr;
use std::time::Duration as StdDuration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::dto::RateLimitRuleConf;
use crate::error::{ApiResponse, ControlPlaneError, Result};
use crate::extract::AdminScope;
use crate::feeds::FeedUpdate;
use crate::guard::RateLimitRule;
use crate::policy::{AccessRule, AccessType, RuleType};
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new()
        .route("/feeds/status", get(feeds_status))
        .route("/rate-limit/rules", get(get_rate_limit_rules).put(put_rate_limit_rules))
        .route("/rules", axum::routing::post(create_rule))
        .route("/rules/{user_id}/{rule_id}", put(update_rule))
        .route("/rules/{rule_id}", axum::routing::delete(delete_rule))
}

#[derive(Deserialize)]
struct FeedsStatusQuery {
    source: Option<String>,
}

async fn feeds_status(
    _scope: AdminScope,
    State(state): State<AppState>,
    Query(query): Query<FeedsStatusQuery>,
) -> Json<ApiResponse<Vec<FeedUpdate>>> {
    Json(ApiResponse::ok(state.feeds.recent_updates(query.source.as_deref())))
}

async fn get_rate_limit_rules(_scope: AdminScope, State(state): State<AppState>) -> Json<ApiResponse<Vec<RateLimitRuleConf>>> {
    Json(ApiResponse::ok(state.guard.rules().iter().map(to_conf).collect()))
}

async fn put_rate_limit_rules(
    _scope: AdminScope,
    State(state): State<AppState>,
    Json(body): Json<Vec<RateLimitRuleConf>>,
) -> Result<Json<ApiResponse<Vec<RateLimitRuleConf>>>> {
    let rules = body
        .iter()
        .map(from_conf)
        .collect::<core::result::Result<Vec<_>, ControlPlaneError>>()?;

    state.guard.set_rules(rules);

    Ok(Json(ApiResponse::ok(body)))
}

#[derive(Deserialize)]
struct CreateRuleRequest {
    user_id: String,
    rule_type: RuleType,
    access_type: AccessType,
    pattern: String,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Mirrors `GET /api/v1/firewall/rules` with the create verb (SPEC_FULL.md
/// §6's admin surface adds CRUD on top of the headend-scoped reads).
async fn create_rule(
    _scope: AdminScope,
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> Result<Json<ApiResponse<AccessRule>>> {
    let rule = state.policy.add(AccessRule {
        id: Uuid::nil(), // overwritten by `PolicyStore::add`
        user_id: body.user_id.clone(),
        rule_type: body.rule_type,
        access_type: body.access_type,
        pattern: body.pattern,
        priority: body.priority,
        is_active: body.is_active,
    });

    state.rule_cache.invalidate_user(&body.user_id).await;
    Ok(Json(ApiResponse::ok(rule)))
}

#[derive(Deserialize)]
struct UpdateRuleRequest {
    rule_type: Option<RuleType>,
    access_type: Option<AccessType>,
    pattern: Option<String>,
    priority: Option<i64>,
    is_active: Option<bool>,
}

async fn update_rule(
    _scope: AdminScope,
    State(state): State<AppState>,
    Path((user_id, rule_id)): Path<(String, Uuid)>,
    Json(body): Json<UpdateRuleRequest>,
) -> Result<Json<ApiResponse<AccessRule>>> {
    let updated = state.policy.update(&user_id, rule_id, |rule| {
        if let Some(rule_type) = body.rule_type {
            rule.rule_type = rule_type;
        }
        if let Some(access_type) = body.access_type {
            rule.access_type = access_type;
        }
        if let Some(pattern) = body.pattern {
            rule.pattern = pattern;
        }
        if let Some(priority) = body.priority {
            rule.priority = priority;
        }
        if let Some(is_active) = body.is_active {
            rule.is_active = is_active;
        }
    })?;

    state.rule_cache.invalidate_user(&user_id).await;
    Ok(Json(ApiResponse::ok(updated)))
}

/// Deletion by rule id alone, without the owning user in the path: the
/// affected user isn't known ahead of the scan, so the cache invalidation
/// falls back to `invalidate_all` rather than a single `firewall:user:{id}`
/// key (see `rule_cache.rs`).
async fn delete_rule(_scope: AdminScope, State(state): State<AppState>, Path(rule_id): Path<Uuid>) -> Result<Json<ApiResponse<()>>> {
    let removed = state
        .policy
        .get_all()
        .into_keys()
        .any(|user_id| state.policy.remove(&user_id, rule_id));

    if !removed {
        return Err(ControlPlaneError::not_found("rule not found"));
    }

    state.rule_cache.invalidate_all().await;
    Ok(Json(ApiResponse::ok(())))
}

fn to_conf(rule: &RateLimitRule) -> RateLimitRuleConf {
    RateLimitRuleConf {
        name: rule.name.clone(),
        priority: rule.priority,
        max_requests: rule.max_requests,
        window_secs: rule.window.as_secs(),
        block_duration_secs: rule.block_duration.as_secs(),
        endpoints: rule.endpoints.clone(),
        exempt_ips: rule.exempt_ips.iter().map(IpAddr::to_string).collect(),
    }
}

fn from_conf(conf: &RateLimitRuleConf) -> Result<RateLimitRule> {
    let exempt_ips = conf
        .exempt_ips
        .iter()
        .map(|s| s.parse::<IpAddr>())
        .collect::<core::result::Result<Vec<_>, _>>()
        .map_err(|e| ControlPlaneError::validation("exempt_ips contains an invalid IP address").with_source(e))?;

    Ok(RateLimitRule {
        name: conf.name.clone(),
        priority: conf.priority,
        max_requests: conf.max_requests,
        window: StdDuration::from_secs(conf.window_secs),
        block_duration: StdDuration::from_secs(conf.block_duration_secs),
        endpoints: conf.endpoints.clone(),
        exempt_ips,
    })
}
