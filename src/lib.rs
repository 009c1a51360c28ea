//! Authentication core
//!
//! Verifies externally presented credentials and maps them to a policy role,
//! which then receives a short-lived access token.
//!
//! # Features
//!
//! - **Pluggable authenticators**: default API key (`authn`), JWT (`authn-jwt`),
//!   OIDC ID tokens or authorization codes (`authn-oidc`), LDAP bind
//!   (`authn-ldap`), Kubernetes pods (`authn-k8s`) and GCP identity tokens
//!   (`authn-gcp`) behind one [`authenticators::Authenticator`] trait
//! - **Security pipeline**: account, webservice, allow-list, role and privilege
//!   checks before any strategy runs
//! - **JWKS / OIDC discovery**: cached signing keys with a per-webservice
//!   refresh budget and a global in-flight limit
//! - **Resource restrictions**: nested claim paths, claim aliases and
//!   enforced claims
//! - **Audit**: exactly one structured event per outcome

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod authenticators;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod input;
pub mod jwt;
pub mod policy;
pub mod registry;
pub mod secrets;
pub mod security;
pub mod strategy;
pub mod token;

pub use authn_types::{ResourceId, Webservice};
pub use error::{Error, ErrorKind, Result};
pub use strategy::{AuthenticationStrategy, Integrations, StrategyParts};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` takes precedence over `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(e.to_string())),
    }
}
