//! End-to-end exercise of the enrollment → token → policy path against an
//! in-process router, mirroring how the teacher drives its own HTTP surface
//! in its integration tests (build the `Router`, call it directly via
//! `tower::ServiceExt::oneshot`, no real socket).

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use control_plane::api;
use control_plane::ca::CertificateAuthority;
use control_plane::clients::{ClientRegistry, ClientRegistryConfig};
use control_plane::clusters::ClusterRegistry;
use control_plane::config::ConfHandle;
use control_plane::config::dto::ConfFile;
use control_plane::feeds::ThreatFeedStore;
use control_plane::guard::RequestGuard;
use control_plane::memory_cache::InProcessTokenCache;
use control_plane::policy::PolicyStore;
use control_plane::rule_cache::RuleCache;
use control_plane::state::AppState;
use control_plane::token::{TokenService, TokenServiceConfig};
use http_body_util::BodyExt as _;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt as _;

fn test_app() -> Router {
    let conf_handle = ConfHandle::mock(ConfFile::default()).expect("mock conf");
    let conf = conf_handle.get_conf();

    let ca = Arc::new(CertificateAuthority::bootstrap(conf.ipam_reuse_grace, &conf.ca_key_source).expect("bootstrap CA"));
    let clusters = Arc::new(ClusterRegistry::new());
    let clients = Arc::new(ClientRegistry::new(clusters.clone(), ClientRegistryConfig::default()));
    let tokens = Arc::new(
        TokenService::generate_keypair(InProcessTokenCache::new(), TokenServiceConfig::default()).expect("generate signing key"),
    );
    let policy = Arc::new(PolicyStore::new());
    let rule_cache = Arc::new(RuleCache::new(None, policy.clone()));
    let feeds = Arc::new(ThreatFeedStore::new(Vec::new()));
    let guard = Arc::new(RequestGuard::new(Vec::new()));

    let state = AppState {
        conf_handle,
        ca,
        clusters,
        clients,
        tokens,
        policy,
        rule_cache,
        feeds,
        guard,
    };

    api::make_router(state)
}

async fn json_request(app: &Router, method: &str, uri: &str, bearer: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder.body(Body::from(body.to_string())).expect("valid request");

    let response = app.clone().oneshot(request).await.expect("router does not fail");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("collect body").to_bytes();
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("valid json body") };
    (status, json)
}

#[tokio::test]
async fn cluster_and_client_enroll_then_client_obtains_a_token() {
    let app = test_app();

    let (status, cluster_body) = json_request(
        &app,
        "POST",
        "/api/v1/clusters/register",
        None,
        json!({
            "name": "edge-1",
            "region": "us-east",
            "datacenter": "dc1",
            "headend_url": "https://edge-1.example.net",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cluster_id = cluster_body["data"]["cluster_id"].as_str().expect("cluster_id").to_owned();
    let cluster_api_key = cluster_body["data"]["api_key"].as_str().expect("api_key").to_owned();

    let (status, client_body) = json_request(
        &app,
        "POST",
        "/api/v1/clients/register",
        None,
        json!({
            "name": "laptop-42",
            "type": "native",
            "public_key": "zqF3k3v2h7p9s1a0m8b6c4d2e0f8g6h4i2j0k8l6m4n2o",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let client_id = client_body["data"]["client_id"].as_str().expect("client_id").to_owned();
    let client_api_key = client_body["data"]["api_key"].as_str().expect("api_key").to_owned();
    assert_eq!(client_body["data"]["cluster"]["id"], cluster_id);

    let (status, config_body) = json_request(
        &app,
        "GET",
        &format!("/api/v1/clients/{client_id}/config"),
        Some(&client_api_key),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config_body["data"]["client_id"], client_id);

    let (status, token_body) = json_request(&app, "POST", "/api/v1/auth/token", None, json!({ "api_key": client_api_key })).await;
    assert_eq!(status, StatusCode::OK);
    let access_token = token_body["data"]["access_token"].as_str().expect("access_token").to_owned();

    let (status, validate_body) = json_request(&app, "POST", "/api/v1/auth/validate", Some(&access_token), Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validate_body["data"]["valid"], true);
    assert_eq!(validate_body["data"]["sub"], client_id);
    let permissions = validate_body["data"]["permissions"].as_array().expect("permissions array");
    assert!(permissions.iter().any(|p| p == "connect"));

    let (status, _) = json_request(&app, "POST", "/api/v1/auth/token", None, json!({ "api_key": cluster_api_key })).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn client_config_rejects_mismatched_bearer() {
    let app = test_app();

    let (_, client_body) = json_request(
        &app,
        "POST",
        "/api/v1/clients/register",
        None,
        json!({ "name": "mismatch-test", "type": "docker", "public_key": null }),
    )
    .await;
    let client_id = client_body["data"]["client_id"].as_str().expect("client_id").to_owned();

    let (status, _) = json_request(&app, "GET", &format!("/api/v1/clients/{client_id}/config"), Some("not-a-real-key"), Value::Null).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_surface_requires_admin_permission() {
    let app = test_app();

    let (status, _) = json_request(&app, "GET", "/api/v1/admin/feeds/status", None, Value::Null).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn healthz_is_unauthenticated() {
    let app = test_app();

    let (status, body) = json_request(&app, "GET", "/healthz", None, Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
