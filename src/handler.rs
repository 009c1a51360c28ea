//! HTTP boundary.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/authn/{account}/login` | Exchange HTTP Basic credentials for an API key (default `authn` only) |
//! | `POST` | `/{authenticator}/{account}/authenticate` | Serviceless token authenticators (`authn-gcp`) |
//! | `POST` | `/{authenticator}/{account}/{username}/authenticate` | Default `authn`; body is the API key |
//! | `POST` | `/{authenticator}/{service_id}/{account}/authenticate` | Token identity; body `jwt=...` or `id_token=...` |
//! | `POST` | `/{authenticator}/{service_id}/{account}/{username}/authenticate` | URL identity |
//! | `GET` | `/{authenticator}/{service_id}/{account}/status` | Configuration check |
//! | `GET` | `/authenticators` | Installed, configured and enabled authenticators |
//! | `POST` | `/{authenticator}/{service_id}/{account}` | Create a webservice (`Authorization: Token token="..."`) |
//!
//! Path segments are positional: the router cannot tell `{account}/{username}`
//! from `{service_id}/{account}`, so the authenticator type decides. Errors are
//! JSON `{"error": <kind>, "message": <text>}` with the status of the error kind.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use authn_types::{SERVICELESS_AUTHENTICATORS, Webservice};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{Extensions, HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::input::{AuthenticatorInput, Credential};
use crate::strategy::AuthenticationStrategy;
use crate::{Error, Result};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let body = Json(json!({
            "error": kind.as_str(),
            "message": self.to_string(),
        }));
        let mut response = (kind.status(), body).into_response();
        if let Error::ConcurrentLoad { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the router over a shared strategy.
pub fn router(strategy: Arc<AuthenticationStrategy>) -> Router {
    Router::new()
        .route("/authenticators", get(list_authenticators))
        .route("/{authenticator}/{first}/login", get(login))
        .route("/{authenticator}/{first}/authenticate", post(authenticate_serviceless))
        .route("/{authenticator}/{first}/{second}/authenticate", post(authenticate_three))
        .route(
            "/{authenticator}/{first}/{second}/{third}/authenticate",
            post(authenticate_url_identity),
        )
        .route("/{authenticator}/{first}/{second}/status", get(status))
        .route("/{authenticator}/{first}/{second}", post(create_webservice))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(strategy)
}

/// Bind and serve until Ctrl+C or SIGTERM.
pub async fn serve(addr: SocketAddr, strategy: Arc<AuthenticationStrategy>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    axum::serve(
        listener,
        router(strategy).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

// ── Request helpers ───────────────────────────────────────────────────────

/// Client IP from `X-Forwarded-For` or `X-Real-IP`, else the peer address.
fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

/// Access token from `Authorization: Token token="<t>"`.
fn access_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let quoted = value.trim().strip_prefix("Token")?.trim().strip_prefix("token=")?;
    Some(quoted.trim_matches('"').to_string()).filter(|t| !t.is_empty())
}

/// Username and password from `Authorization: Basic ...`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

async fn run_authenticate(
    strategy: &AuthenticationStrategy,
    input: AuthenticatorInput,
) -> Response {
    match strategy.authenticate(&input).await {
        Ok(token) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token.token,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `GET /authenticators`
async fn list_authenticators(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Query(query): Query<AccountQuery>,
) -> Response {
    let account = query.account.unwrap_or_else(|| strategy.default_account().to_string());
    match strategy.list_authenticators(&account).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AccountQuery {
    account: Option<String>,
}

/// `GET /authn/{account}/login`
async fn login(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Path((authenticator, account)): Path<(String, String)>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let credentials = basic_credentials(&headers);
    let origin = client_ip(&headers, &extensions);
    let outcome = strategy
        .login(
            &authenticator,
            &account,
            credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str())),
            origin,
        )
        .await;
    match outcome {
        Ok(api_key) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], api_key).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /{authenticator}/{account}/authenticate`
async fn authenticate_serviceless(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Path((authenticator, account)): Path<(String, String)>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let origin = client_ip(&headers, &extensions);
    let input = AuthenticatorInput::new(authenticator, None, account, None, Credential::new(body))
        .with_origin(origin)
        .with_headers(headers);
    run_authenticate(&strategy, input).await
}

/// `POST /{authenticator}/{first}/{second}/authenticate`: `{account}/{username}`
/// for serviceless types, `{service_id}/{account}` otherwise.
async fn authenticate_three(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Path((authenticator, first, second)): Path<(String, String, String)>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let origin = client_ip(&headers, &extensions);
    let input = if SERVICELESS_AUTHENTICATORS.contains(&authenticator.as_str()) {
        AuthenticatorInput::new(authenticator, None, first, Some(second), Credential::new(body))
    } else {
        AuthenticatorInput::new(authenticator, Some(first), second, None, Credential::new(body))
    };
    run_authenticate(&strategy, input.with_origin(origin).with_headers(headers)).await
}

/// `POST /{authenticator}/{service_id}/{account}/{username}/authenticate`
async fn authenticate_url_identity(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Path((authenticator, service_id, account, username)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let origin = client_ip(&headers, &extensions);
    let input = AuthenticatorInput::new(
        authenticator,
        Some(service_id),
        account,
        Some(username),
        Credential::new(body),
    )
    .with_origin(origin)
    .with_headers(headers);
    run_authenticate(&strategy, input).await
}

/// `GET /{authenticator}/{service_id}/{account}/status`
async fn status(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Path((authenticator, service_id, account)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let caller = match access_token(&headers).map(|t| strategy.caller(&t)).transpose() {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };
    match strategy
        .status(&authenticator, &account, Some(service_id), caller.as_ref())
        .await
    {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            warn!(authenticator = %authenticator, account = %account, error = %e, "Status check failed");
            e.into_response()
        }
    }
}

/// `POST /{authenticator}/{service_id}/{account}`
async fn create_webservice(
    State(strategy): State<Arc<AuthenticationStrategy>>,
    Path((authenticator, service_id, account)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = access_token(&headers) else {
        return Error::MissingRequestParam("authorization".to_string()).into_response();
    };
    let webservice = match Webservice::new(account, authenticator, Some(service_id)) {
        Ok(ws) => ws,
        Err(e) => return Error::InvalidIdentifier(e).into_response(),
    };
    let variables: BTreeMap<String, String> = if body.is_empty() {
        BTreeMap::new()
    } else {
        match serde_json::from_slice(&body) {
            Ok(vars) => vars,
            Err(e) => return Error::MissingRequestParam(format!("variables: {e}")).into_response(),
        }
    };

    match strategy.create_webservice(&token, &webservice, variables).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "webservice": webservice.name() }))).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn forwarded_for_wins_over_peer() {
        // GIVEN: proxy headers and a peer address
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        let h = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.2")]);

        // THEN
        assert_eq!(client_ip(&h, &extensions), Some("203.0.113.5".parse().unwrap()));
        assert_eq!(
            client_ip(&HeaderMap::new(), &extensions),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            client_ip(&headers(&[("x-real-ip", "198.51.100.9")]), &Extensions::new()),
            Some("198.51.100.9".parse().unwrap())
        );
    }

    #[test]
    fn basic_credentials_decode() {
        let h = headers(&[("authorization", "Basic YWxpY2U6czNjcjp0")]);
        assert_eq!(
            basic_credentials(&h).unwrap(),
            ("alice".to_string(), "s3cr:t".to_string())
        );
        assert!(basic_credentials(&HeaderMap::new()).is_none());
    }

    #[test]
    fn token_authorization_header() {
        let h = headers(&[("authorization", "Token token=\"abc.def\"")]);
        assert_eq!(access_token(&h).as_deref(), Some("abc.def"));
        assert!(access_token(&headers(&[("authorization", "Bearer abc")])).is_none());
    }

    #[test]
    fn concurrent_load_carries_retry_after() {
        let response = Error::ConcurrentLoad { retry_after: 4 }.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[header::RETRY_AFTER], "4");
    }
}
