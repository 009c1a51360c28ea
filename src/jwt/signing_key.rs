//! Signing-key source selection and retrieval.
//!
//! A JWT webservice names exactly one key source:
//!
//! - `provider-uri`: an OIDC provider. Keys come from the `jwks_uri` advertised
//!   in `<provider-uri>/.well-known/openid-configuration`.
//! - `jwks-uri`: a JWKS document fetched directly.
//!
//! [`SigningKeyConfig::resolve`] decides which one once per request; both or
//! neither configured is [`Error::InvalidUriConfiguration`].

use std::time::Duration;

use authn_types::Webservice;
use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{JWKS_URI_VARIABLE, PROVIDER_URI_VARIABLE};
use crate::config::HttpConfig;
use crate::secrets::WebserviceSecrets;
use crate::{Error, Result};

/// The resolved key source of a webservice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKeyConfig {
    /// OIDC discovery against a provider.
    ProviderUri(Url),
    /// Direct JWKS document.
    JwksUri(Url),
}

impl SigningKeyConfig {
    /// Read `provider-uri` and `jwks-uri` and pick the one configured.
    pub async fn resolve(secrets: &WebserviceSecrets<'_>) -> Result<Self> {
        let provider_uri = secrets.present(PROVIDER_URI_VARIABLE).await?;
        let jwks_uri = secrets.present(JWKS_URI_VARIABLE).await?;
        Self::from_values(secrets.webservice(), provider_uri, jwks_uri)
    }

    /// Pick from already-read values. Blank values count as absent.
    pub fn from_values(
        webservice: &Webservice,
        provider_uri: Option<String>,
        jwks_uri: Option<String>,
    ) -> Result<Self> {
        let provider_uri = provider_uri.filter(|v| !v.trim().is_empty());
        let jwks_uri = jwks_uri.filter(|v| !v.trim().is_empty());

        match (provider_uri, jwks_uri) {
            (Some(uri), None) => Ok(Self::ProviderUri(parse_uri(PROVIDER_URI_VARIABLE, &uri)?)),
            (None, Some(uri)) => Ok(Self::JwksUri(parse_uri(JWKS_URI_VARIABLE, &uri)?)),
            _ => Err(Error::InvalidUriConfiguration {
                webservice: webservice.name(),
                provider_uri: PROVIDER_URI_VARIABLE,
                jwks_uri: JWKS_URI_VARIABLE,
            }),
        }
    }

    /// The configured URI.
    pub fn uri(&self) -> &Url {
        match self {
            Self::ProviderUri(uri) | Self::JwksUri(uri) => uri,
        }
    }

    /// Issuer assumed when no `issuer` variable is set and discovery did not
    /// name one: the provider URI, or the origin of the JWKS URI.
    #[must_use]
    pub fn default_issuer(&self) -> String {
        match self {
            Self::ProviderUri(uri) => uri.as_str().trim_end_matches('/').to_string(),
            Self::JwksUri(uri) => uri.origin().ascii_serialization(),
        }
    }
}

fn parse_uri(variable: &str, value: &str) -> Result<Url> {
    let uri = Url::parse(value.trim()).map_err(|e| Error::InvalidUri {
        variable: variable.to_string(),
        cause: e.to_string(),
    })?;
    if !matches!(uri.scheme(), "http" | "https") {
        return Err(Error::InvalidUri {
            variable: variable.to_string(),
            cause: format!("unsupported scheme '{}'", uri.scheme()),
        });
    }
    Ok(uri)
}

/// Fetched verification keys.
#[derive(Debug, Clone)]
pub struct KeySet {
    /// The JWKS.
    pub jwks: JwkSet,
    /// Issuer advertised by discovery, when keys came from a provider.
    pub issuer: Option<String>,
}

/// Retrieves key sets over the network.
#[async_trait::async_trait]
pub trait SigningKeySource: Send + Sync {
    /// Fetch the key set for `config`.
    async fn fetch(&self, config: &SigningKeyConfig) -> Result<KeySet>;
}

/// Subset of an OIDC discovery document.
#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// JWKS location
    pub jwks_uri: Url,
    /// Authorization-code exchange endpoint, when advertised
    pub token_endpoint: Option<Url>,
    /// Userinfo endpoint, when advertised
    pub userinfo_endpoint: Option<Url>,
    /// Signing algorithms advertised for ID tokens
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Discovery document as served; endpoints are validated by [`ProviderMetadata::from_document`].
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    #[serde(default)]
    id_token_signing_alg_values_supported: Vec<String>,
}

impl ProviderMetadata {
    fn from_document(document: DiscoveryDocument) -> std::result::Result<Self, String> {
        let parse = |field: &str, value: &str| {
            Url::parse(value.trim()).map_err(|e| format!("{field} '{value}': {e}"))
        };
        let optional = |field: &str, value: Option<String>| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| parse(field, &v))
                .transpose()
        };
        Ok(Self {
            jwks_uri: parse("jwks_uri", &document.jwks_uri)?,
            token_endpoint: optional("token_endpoint", document.token_endpoint)?,
            userinfo_endpoint: optional("userinfo_endpoint", document.userinfo_endpoint)?,
            issuer: document.issuer,
            id_token_signing_alg_values_supported: document.id_token_signing_alg_values_supported,
        })
    }
}

/// [`SigningKeySource`] over HTTP(S).
#[derive(Clone)]
pub struct HttpKeySource {
    http: reqwest::Client,
}

impl HttpKeySource {
    /// Create with per-call timeouts from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Self::with_timeouts(config.timeout, config.connect_timeout)
    }

    /// Create with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn with_timeouts(timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Run OIDC discovery against `provider`.
    ///
    /// # Errors
    ///
    /// [`Error::ProviderDiscoveryTimeout`] on a network timeout and
    /// [`Error::ProviderDiscoveryFailed`] for any other failure.
    pub async fn discover(&self, provider: &Url) -> Result<ProviderMetadata> {
        let url = discovery_url(provider);
        debug!(provider_uri = %provider, "Running OIDC discovery");

        let failed = |cause: String| Error::ProviderDiscoveryFailed {
            provider_uri: provider.to_string(),
            cause,
        };

        let response = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::ProviderDiscoveryTimeout {
                    provider_uri: provider.to_string(),
                    cause: e.to_string(),
                }
            } else {
                failed(e.to_string())
            }
        })?;
        let response = response.error_for_status().map_err(|e| failed(e.to_string()))?;
        let document = response.json::<DiscoveryDocument>().await.map_err(|e| {
            if e.is_timeout() {
                Error::ProviderDiscoveryTimeout {
                    provider_uri: provider.to_string(),
                    cause: e.to_string(),
                }
            } else {
                failed(e.to_string())
            }
        })?;
        ProviderMetadata::from_document(document).map_err(failed)
    }

    async fn get_jwks(&self, uri: &Url) -> std::result::Result<JwkSet, String> {
        debug!(jwks_uri = %uri, "Fetching JWKS");
        self.http
            .get(uri.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?
            .json::<JwkSet>()
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait::async_trait]
impl SigningKeySource for HttpKeySource {
    async fn fetch(&self, config: &SigningKeyConfig) -> Result<KeySet> {
        match config {
            SigningKeyConfig::ProviderUri(provider) => {
                let metadata = self.discover(provider).await?;
                let jwks = self.get_jwks(&metadata.jwks_uri).await.map_err(|cause| {
                    Error::FetchProviderKeysFailed {
                        provider_uri: provider.to_string(),
                        cause,
                    }
                })?;
                Ok(KeySet {
                    jwks,
                    issuer: Some(metadata.issuer),
                })
            }
            SigningKeyConfig::JwksUri(uri) => {
                let jwks = self
                    .get_jwks(uri)
                    .await
                    .map_err(|cause| Error::FetchJwksKeysFailed {
                        jwks_uri: uri.to_string(),
                        cause,
                    })?;
                Ok(KeySet { jwks, issuer: None })
            }
        }
    }
}

/// `<provider>/.well-known/openid-configuration`, without a doubled slash.
fn discovery_url(provider: &Url) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        provider.as_str().trim_end_matches('/')
    )
}
