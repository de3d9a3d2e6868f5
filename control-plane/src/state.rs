//! Composition root's product: every component wired together behind one
//! cheaply `Clone`-able handle, passed to axum via `.with_state`.

use std::sync::Arc;

use crate::ca::CertificateAuthority;
use crate::clients::ClientRegistry;
use crate::clusters::ClusterRegistry;
use crate::config::ConfHandle;
use crate::feeds::ThreatFeedStore;
use crate::guard::RequestGuard;
use crate::policy::PolicyStore;
use crate::rule_cache::RuleCache;
use crate::token::TokenService;

#[derive(Clone)]
pub struct AppState {
    pub conf_handle: ConfHandle,
    pub ca: Arc<CertificateAuthority>,
    pub clusters: Arc<ClusterRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub tokens: Arc<TokenService>,
    pub policy: Arc<PolicyStore>,
    pub rule_cache: Arc<RuleCache>,
    pub feeds: Arc<ThreatFeedStore>,
    pub guard: Arc<RequestGuard>,
}

impl axum::extract::FromRef<AppState> for Arc<TokenService> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<RequestGuard> {
    fn from_ref(state: &AppState) -> Self {
        state.guard.clone()
    }
}
