//! HTTP boundary: routing, status mapping and error bodies.

use std::collections::BTreeMap;
use std::sync::Arc;

use authn_core::audit::TracingAuditSink;
use authn_core::config::Config;
use authn_core::handler::router;
use authn_core::policy::{InMemoryPolicyStore, UPDATE_PRIVILEGE};
use authn_core::{AuthenticationStrategy, Integrations, ResourceId};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

fn alice() -> ResourceId {
    ResourceId::new("acme", "user", "alice")
}

fn app() -> Router {
    let store = Arc::new(InMemoryPolicyStore::new());
    store.add_role(ResourceId::admin("acme"), BTreeMap::new());
    store.add_role(alice(), BTreeMap::new());
    store.set_api_key(&alice(), "alice-key".to_string());
    store.set_password(&alice(), "pw".to_string());
    store.permit(&alice(), UPDATE_PRIVILEGE, &ResourceId::new("acme", "policy", "root"));

    let config = Config {
        account: "acme".to_string(),
        ..Config::default()
    };
    let strategy = AuthenticationStrategy::from_config(&config, store, Integrations::default(), Arc::new(TracingAuditSink)).unwrap();
    router(Arc::new(strategy))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn access_token(app: Router) -> String {
    let (status, _, body) = send(app, post("/authn/acme/alice/authenticate", "alice-key")).await;
    assert_eq!(status, StatusCode::OK);
    String::from_utf8(body).unwrap()
}

#[tokio::test]
async fn api_key_authenticates() {
    let token = access_token(app()).await;
    assert_eq!(token.split('.').count(), 3);
}

#[tokio::test]
async fn wrong_api_key_is_401_with_error_kind() {
    // WHEN
    let (status, _, body) = send(app(), post("/authn/acme/alice/authenticate", "nope")).await;

    // THEN
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "unauthenticated");
    assert!(!body["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn unknown_authenticator_is_401() {
    let (status, _, _) = send(app(), post("/authn-azure/prod/acme/authenticate", "")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn disabled_authenticator_is_401() {
    // GIVEN: authn-jwt is installed but only the default authenticator is enabled
    let (status, _, body) = send(app(), post("/authn-jwt/gitlab/acme/authenticate", "jwt=x.y.z")).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn login_exchanges_basic_credentials() {
    let request = Request::builder()
        .uri("/authn/acme/login")
        .header(header::AUTHORIZATION, "Basic YWxpY2U6cHc=")
        .body(Body::empty())
        .unwrap();

    let (status, _, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"alice-key");
}

#[tokio::test]
async fn login_without_credentials_is_400() {
    let request = Request::builder().uri("/authn/acme/login").body(Body::empty()).unwrap();
    let (status, _, _) = send(app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn login_is_only_for_default_authenticator() {
    let request = Request::builder()
        .uri("/authn-jwt/acme/login")
        .header(header::AUTHORIZATION, "Basic YWxpY2U6cHc=")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(app(), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticators_lists_installed_and_enabled() {
    let request = Request::builder().uri("/authenticators").body(Body::empty()).unwrap();

    let (status, _, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    let installed: Vec<&str> = body["installed"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(installed, vec!["authn", "authn-gcp", "authn-jwt", "authn-oidc"]);
    assert_eq!(body["enabled"], serde_json::json!(["authn"]));
}

#[tokio::test]
async fn create_webservice_then_duplicate_is_409_with_retry_after() {
    // GIVEN: alice may update the root policy
    let app = app();
    let token = access_token(app.clone()).await;
    let create = || {
        Request::builder()
            .method("POST")
            .uri("/authn-jwt/gitlab/acme")
            .header(header::AUTHORIZATION, format!("Token token=\"{token}\""))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"jwks-uri":"https://gitlab.example.com/jwks"}"#))
            .unwrap()
    };

    // WHEN
    let (first, _, _) = send(app.clone(), create()).await;
    let (second, headers, _) = send(app, create()).await;

    // THEN
    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(second, StatusCode::CONFLICT);
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=8).contains(&retry_after));
}

#[tokio::test]
async fn create_webservice_requires_access_token() {
    let (status, _, _) = send(app(), post("/authn-jwt/gitlab/acme", "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_of_default_authenticator_is_ok() {
    let request = Request::builder().uri("/authn/x/acme/status").body(Body::empty()).unwrap();
    let (status, _, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
}
