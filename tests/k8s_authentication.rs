//! `authn-k8s` through the HTTP boundary with a fake Kubernetes API.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use authn_core::audit::TracingAuditSink;
use authn_core::authenticators::K8sObjectLookup;
use authn_core::authenticators::k8s::{K8sObject, ObjectKind, OwnerReference, POD_IDENTITY_HEADER};
use authn_core::config::Config;
use authn_core::handler::router;
use authn_core::policy::{AUTHENTICATE_PRIVILEGE, InMemoryPolicyStore, PolicyStore};
use authn_core::{AuthenticationStrategy, Integrations, ResourceId, Webservice};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

const HOST_PATH: &str = "host%2Fapps%2Fprod%2Fdeployment%2Fapp";

/// Deployment `app` → ReplicaSet `app-5d8` → pod `app-5d8-x`, all in `prod`.
struct FakeCluster(HashMap<(ObjectKind, String), K8sObject>);

impl FakeCluster {
    fn new() -> Self {
        let object = |name: &str, owner: Option<(ObjectKind, &str)>| K8sObject {
            name: name.to_string(),
            namespace: "prod".to_string(),
            owner_references: owner.map(|(k, n)| OwnerReference::new(k, n)).into_iter().collect(),
            service_account_name: None,
        };
        Self(HashMap::from([
            ((ObjectKind::Deployment, "app".to_string()), object("app", None)),
            (
                (ObjectKind::ReplicaSet, "app-5d8".to_string()),
                object("app-5d8", Some((ObjectKind::Deployment, "app"))),
            ),
            (
                (ObjectKind::Pod, "app-5d8-x".to_string()),
                object("app-5d8-x", Some((ObjectKind::ReplicaSet, "app-5d8"))),
            ),
        ]))
    }
}

#[async_trait::async_trait]
impl K8sObjectLookup for FakeCluster {
    async fn find_object(&self, kind: ObjectKind, name: &str, namespace: &str) -> authn_core::Result<Option<K8sObject>> {
        Ok(self
            .0
            .get(&(kind, name.to_string()))
            .filter(|o| o.namespace == namespace)
            .cloned())
    }

    async fn namespace_labels(&self, _namespace: &str) -> authn_core::Result<Option<BTreeMap<String, String>>> {
        Ok(None)
    }
}

async fn app() -> Router {
    let store = Arc::new(InMemoryPolicyStore::new());
    let ws = Webservice::parse("acme", "authn-k8s/cluster").unwrap();
    store.add_role(ResourceId::admin("acme"), BTreeMap::new());
    store.create_webservice(&ws, BTreeMap::new()).await.unwrap();
    let host = ResourceId::new("acme", "host", "apps/prod/deployment/app");
    store.add_role(host.clone(), BTreeMap::new());
    store.permit(&host, AUTHENTICATE_PRIVILEGE, &ws.resource_id());

    let config = Config {
        account: "acme".to_string(),
        authenticators: vec!["authn".to_string(), "authn-k8s/cluster".to_string()],
        ..Config::default()
    };
    let integrations = Integrations {
        kubernetes: Some(Arc::new(FakeCluster::new()) as Arc<dyn K8sObjectLookup>),
        ..Integrations::default()
    };
    let strategy = AuthenticationStrategy::from_config(&config, store, integrations, Arc::new(TracingAuditSink)).unwrap();
    router(Arc::new(strategy))
}

fn authenticate(pod: Option<&str>) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(format!("/authn-k8s/cluster/acme/{HOST_PATH}/authenticate"));
    if let Some(pod) = pod {
        request = request.header(
            POD_IDENTITY_HEADER,
            format!("spiffe://cluster.local/namespace/prod/pod/{pod}"),
        );
    }
    request.body(Body::empty()).unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn pod_of_the_host_deployment_gets_an_access_token() {
    // WHEN: the deployment's pod authenticates as its host
    let (status, body) = send(app().await, authenticate(Some("app-5d8-x"))).await;

    // THEN
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap().split('.').count(), 3);
}

#[tokio::test]
async fn unknown_pod_is_401() {
    let (status, body) = send(app().await, authenticate(Some("ghost"))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn request_without_pod_identity_is_401() {
    let (status, _) = send(app().await, authenticate(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn k8s_is_installed_when_a_cluster_client_is_given() {
    let request = Request::builder().uri("/authenticators").body(Body::empty()).unwrap();

    let (status, body) = send(app().await, request).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["installed"].as_array().unwrap().iter().any(|v| v == "authn-k8s"));
    assert_eq!(body["enabled"], serde_json::json!(["authn", "authn-k8s/cluster"]));
}
