use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::config::dto::ConfFile;
use crate::error::{ApiResponse, ControlPlaneError, Result};
use crate::extract::AdminScope;
use crate::state::AppState;

pub fn make_router() -> Router<AppState> {
    Router::new().route("/", get(get_config).patch(patch_config))
}

/// Returns the current configuration file, admin-scoped since it carries
/// feed source URLs and rate-limit rule internals.
async fn get_config(_scope: AdminScope, State(state): State<AppState>) -> Json<ConfFile> {
    Json((*state.conf_handle.get_conf_file()).clone())
}

/// Keys an admin may patch live. `listen_address`, `data_dir`, `overlay_cidr`,
/// and `ca_key_source` are consulted once at process start by something that
/// can't be swapped out from under itself, so they require a restart
/// instead. `rate_limit_rules` and `feed_sources` are likewise excluded even
/// though they're mutable at runtime: `guard.rs`'s rate-limit rules and
/// `feeds.rs`'s sources are each already owned by their own dedicated admin
/// endpoint (`PUT /admin/rate-limit/rules`; feed sources have no runtime
/// mutator at all), so patching them here would update the file on disk
/// without updating the live state those endpoints actually read from.
const KEY_ALLOWLIST: &[&str] = &[
    "access_token_lifetime_hours",
    "refresh_token_lifetime_days",
    "verbosity_profile",
    "ipam_reuse_grace_hours",
    "rotate_key_grace_seconds",
];

/// JSON-merge-patches the allowlisted keys into the current configuration
/// and persists the result, waking every `ConfHandle::change_notified`
/// waiter. Mirrors the teacher's `patch_config`, adapted from its
/// `ConfigWriteScope` to this repo's ambient `AdminScope`.
async fn patch_config(
    _scope: AdminScope,
    State(state): State<AppState>,
    Json(patch): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<ApiResponse<ConfFile>>> {
    if !patch.keys().all(|key| KEY_ALLOWLIST.contains(&key.as_str())) {
        return Err(ControlPlaneError::validation("patch contains a key that is not allowed"));
    }

    let mut new_conf_file = serde_json::to_value(&*state.conf_handle.get_conf_file())
        .map_err(|e| ControlPlaneError::store("failed to serialize configuration").with_source(e))?;

    let object = new_conf_file.as_object_mut().expect("ConfFile serializes to a JSON object");
    for (key, value) in patch {
        object.insert(key, value);
    }

    let new_conf_file: ConfFile = serde_json::from_value(new_conf_file)
        .map_err(|e| ControlPlaneError::validation("patch produced an invalid configuration").with_source(e))?;

    state
        .conf_handle
        .save_new_conf_file(new_conf_file.clone())
        .map_err(|e| ControlPlaneError::store("failed to save configuration").with_source(e))?;

    Ok(Json(ApiResponse::ok(new_conf_file)))
}
