//! `authn-oidc`: identities asserted by an OIDC provider.
//!
//! Two flows share the provider's signing keys through the signing-key cache:
//!
//! - ID token: the client posts `id_token=<jwt>`; the username is the claim
//!   named by `id-token-user-property`.
//! - Authorization code: enabled by a `client-id` variable. The client posts
//!   `code=<code>`, which is redeemed at the discovered token endpoint with
//!   the webservice's client credentials. The returned ID token must be
//!   issued for `client-id` by the discovered issuer, the userinfo subject
//!   must equal the ID token subject, and the username is the userinfo
//!   `preferred_username`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use authn_types::{ResourceId, Webservice};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{Authenticator, RoleIdentity};
use crate::config::HttpConfig;
use crate::input::AuthenticatorInput;
use crate::jwt::PROVIDER_URI_VARIABLE;
use crate::jwt::claims::{ClaimPath, ClaimsValidator};
use crate::jwt::key_cache::SigningKeyResolver;
use crate::jwt::signing_key::{HttpKeySource, SigningKeyConfig};
use crate::jwt::verify::verify_with_refresh;
use crate::policy::PolicyStore;
use crate::secrets::WebserviceSecrets;
use crate::{Error, Result};

/// Authenticator type name.
pub const AUTHENTICATOR_NAME: &str = "authn-oidc";

/// Variable naming the username claim.
pub const USER_PROPERTY_VARIABLE: &str = "id-token-user-property";

/// Variable holding the registered client id. Its presence selects the
/// authorization-code flow.
pub const CLIENT_ID_VARIABLE: &str = "client-id";

/// Variable holding the client secret.
pub const CLIENT_SECRET_VARIABLE: &str = "client-secret";

/// Variable holding the redirect URI registered with the provider.
pub const REDIRECT_URI_VARIABLE: &str = "redirect-uri";

/// Form field carrying the ID token.
pub const ID_TOKEN_PARAM: &str = "id_token";

/// Form field carrying the authorization code.
pub const CODE_PARAM: &str = "code";

/// Client registration used to redeem an authorization code.
#[derive(Clone)]
pub struct OidcClientSettings {
    /// Provider base URI.
    pub provider_uri: Url,
    /// Registered client id; the expected ID token audience.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Redirect URI the code was issued for.
    pub redirect_uri: Url,
}

impl fmt::Debug for OidcClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcClientSettings")
            .field("provider_uri", &self.provider_uri.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .finish()
    }
}

/// Userinfo claims the code flow reads.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// Subject.
    pub sub: String,
    /// Username, present when the `profile` scope was granted.
    #[serde(default)]
    pub preferred_username: Option<String>,
}

/// Result of redeeming an authorization code.
#[derive(Debug, Clone)]
pub struct CodeGrant {
    /// Raw ID token from the token endpoint.
    pub id_token: String,
    /// Userinfo fetched with the granted access token.
    pub user_info: UserInfo,
}

/// Provider client for the authorization-code flow.
#[async_trait::async_trait]
pub trait OidcCodeClient: Send + Sync {
    /// Redeem `code` at the provider's token endpoint, then read userinfo with
    /// the granted access token.
    ///
    /// A refused code is [`Error::OidcCodeRejected`]; transport and server
    /// failures are [`Error::OidcEndpointFailed`].
    async fn redeem(&self, settings: &OidcClientSettings, code: &str) -> Result<CodeGrant>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`OidcCodeClient`] over HTTP(S), using OIDC discovery for the endpoints.
#[derive(Clone)]
pub struct HttpOidcClient {
    http: reqwest::Client,
    discovery: HttpKeySource,
}

impl HttpOidcClient {
    /// Create with per-call timeouts from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            discovery: HttpKeySource::new(config)?,
        })
    }
}

fn endpoint_failed(endpoint: &Url, cause: impl fmt::Display) -> Error {
    Error::OidcEndpointFailed {
        endpoint: endpoint.to_string(),
        cause: cause.to_string(),
    }
}

#[async_trait::async_trait]
impl OidcCodeClient for HttpOidcClient {
    async fn redeem(&self, settings: &OidcClientSettings, code: &str) -> Result<CodeGrant> {
        let metadata = self.discovery.discover(&settings.provider_uri).await?;
        let not_advertised = |field: &str| Error::ProviderDiscoveryFailed {
            provider_uri: settings.provider_uri.to_string(),
            cause: format!("{field} not advertised"),
        };
        let token_endpoint = metadata
            .token_endpoint
            .ok_or_else(|| not_advertised("token_endpoint"))?;
        let userinfo_endpoint = metadata
            .userinfo_endpoint
            .ok_or_else(|| not_advertised("userinfo_endpoint"))?;

        debug!(token_endpoint = %token_endpoint, "Redeeming authorization code");
        let response = self
            .http
            .post(token_endpoint.clone())
            .basic_auth(&settings.client_id, Some(&settings.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", settings.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| endpoint_failed(&token_endpoint, e))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let cause = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(description) => format!("{}: {description}", e.error),
                    None => e.error,
                })
                .unwrap_or_else(|_| status.to_string());
            warn!(token_endpoint = %token_endpoint, %status, "Authorization code rejected");
            return Err(Error::OidcCodeRejected(cause));
        }
        let tokens = response
            .error_for_status()
            .map_err(|e| endpoint_failed(&token_endpoint, e))?
            .json::<TokenResponse>()
            .await
            .map_err(|e| endpoint_failed(&token_endpoint, e))?;
        let id_token = tokens
            .id_token
            .ok_or_else(|| endpoint_failed(&token_endpoint, "response carries no id_token"))?;

        let user_info = self
            .http
            .get(userinfo_endpoint.clone())
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| endpoint_failed(&userinfo_endpoint, e))?
            .json::<UserInfo>()
            .await
            .map_err(|e| endpoint_failed(&userinfo_endpoint, e))?;

        Ok(CodeGrant { id_token, user_info })
    }
}

/// The `authn-oidc` authenticator.
pub struct OidcAuthenticator {
    store: Arc<dyn PolicyStore>,
    keys: Arc<SigningKeyResolver>,
    client: Arc<dyn OidcCodeClient>,
    leeway: Duration,
}

impl OidcAuthenticator {
    /// Create with explicit collaborators.
    pub fn new(
        store: Arc<dyn PolicyStore>,
        keys: Arc<SigningKeyResolver>,
        client: Arc<dyn OidcCodeClient>,
        leeway: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            client,
            leeway,
        }
    }

    async fn key_config(&self, secrets: &WebserviceSecrets<'_>) -> Result<SigningKeyConfig> {
        let provider_uri = secrets.required(PROVIDER_URI_VARIABLE).await?;
        SigningKeyConfig::from_values(secrets.webservice(), Some(provider_uri), None)
    }

    async fn id_token_settings(&self, webservice: &Webservice) -> Result<(SigningKeyConfig, ClaimPath)> {
        let secrets = WebserviceSecrets::new(self.store.as_ref(), webservice);
        let key_config = self.key_config(&secrets).await?;
        let user_property = secrets.required(USER_PROPERTY_VARIABLE).await?;
        let claim = ClaimPath::parse(&user_property)
            .map_err(|_| Error::InvalidTokenAppPropertyValue(user_property.clone()))?;
        Ok((key_config, claim))
    }

    async fn code_settings(
        &self,
        webservice: &Webservice,
        client_id: String,
    ) -> Result<(SigningKeyConfig, OidcClientSettings)> {
        let secrets = WebserviceSecrets::new(self.store.as_ref(), webservice);
        let key_config = self.key_config(&secrets).await?;
        let client_secret = secrets.required(CLIENT_SECRET_VARIABLE).await?;
        let redirect_uri = secrets.required(REDIRECT_URI_VARIABLE).await?;
        let redirect_uri = Url::parse(redirect_uri.trim()).map_err(|e| Error::InvalidUri {
            variable: webservice.variable_id(REDIRECT_URI_VARIABLE).to_string(),
            cause: e.to_string(),
        })?;
        let settings = OidcClientSettings {
            provider_uri: key_config.uri().clone(),
            client_id,
            client_secret,
            redirect_uri,
        };
        Ok((key_config, settings))
    }

    async fn verify_id_token(&self, webservice: &Webservice, id_token: &str) -> Result<RoleIdentity> {
        let (key_config, claim) = self.id_token_settings(webservice).await?;

        let (decoded, keys) =
            verify_with_refresh(&self.keys, webservice, &key_config, id_token, self.leeway).await?;
        let validator = ClaimsValidator {
            issuer: keys.keys.issuer.clone().or_else(|| Some(key_config.default_issuer())),
            leeway: self.leeway,
            ..ClaimsValidator::default()
        };
        validator.validate_standard(&decoded)?;

        let username = decoded
            .lookup_string(claim.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::NoSuchFieldInToken(claim.to_string()))?;

        debug!(webservice = %webservice, claim = %claim, "ID token verified");
        Ok(RoleIdentity::new(ResourceId::from_username(webservice.account(), &username)))
    }

    async fn redeem_code(&self, webservice: &Webservice, client_id: String, code: &str) -> Result<RoleIdentity> {
        let (key_config, settings) = self.code_settings(webservice, client_id).await?;
        let grant = self.client.redeem(&settings, code).await?;

        let (decoded, keys) =
            verify_with_refresh(&self.keys, webservice, &key_config, &grant.id_token, self.leeway).await?;
        if decoded.claims().get("iss").is_none() {
            return Err(Error::MissingMandatoryClaim("iss".to_string()));
        }
        let validator = ClaimsValidator {
            issuer: keys.keys.issuer.clone().or_else(|| Some(key_config.default_issuer())),
            audience: Some(settings.client_id.clone()),
            leeway: self.leeway,
            ..ClaimsValidator::default()
        };
        validator.validate_standard(&decoded)?;

        let subject = decoded
            .lookup_string("sub")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::MissingMandatoryClaim("sub".to_string()))?;
        if grant.user_info.sub != subject {
            return Err(Error::OidcSubjectMismatch {
                user_info: grant.user_info.sub,
                id_token: subject,
            });
        }
        let username = grant
            .user_info
            .preferred_username
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(Error::OidcProfileScopeMissing)?;

        debug!(webservice = %webservice, "Authorization code redeemed");
        Ok(RoleIdentity::new(ResourceId::from_username(webservice.account(), &username)))
    }
}

#[async_trait::async_trait]
impl Authenticator for OidcAuthenticator {
    fn name(&self) -> &'static str {
        AUTHENTICATOR_NAME
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity> {
        let webservice = input.webservice()?;
        let param = |name: &str| {
            input
                .credential()
                .form_param(name)
                .ok_or_else(|| Error::MissingRequestParam(name.to_string()))
        };

        let secrets = WebserviceSecrets::new(self.store.as_ref(), &webservice);
        match secrets.present(CLIENT_ID_VARIABLE).await? {
            Some(client_id) => {
                let code = param(CODE_PARAM)?;
                self.redeem_code(&webservice, client_id, &code).await
            }
            None => {
                let id_token = param(ID_TOKEN_PARAM)?;
                self.verify_id_token(&webservice, &id_token).await
            }
        }
    }

    async fn status(&self, webservice: &Webservice) -> Result<()> {
        let secrets = WebserviceSecrets::new(self.store.as_ref(), webservice);
        match secrets.present(CLIENT_ID_VARIABLE).await? {
            Some(client_id) => self.code_settings(webservice, client_id).await.map(|_| ()),
            None => self.id_token_settings(webservice).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyCacheConfig;
    use crate::input::Credential;
    use crate::jwt::signing_key::{KeySet, SigningKeySource};
    use crate::policy::InMemoryPolicyStore;

    struct Unreachable;

    #[async_trait::async_trait]
    impl SigningKeySource for Unreachable {
        async fn fetch(&self, config: &SigningKeyConfig) -> Result<KeySet> {
            Err(Error::ProviderDiscoveryFailed {
                provider_uri: config.uri().to_string(),
                cause: "unreachable".into(),
            })
        }
    }

    struct NoProvider;

    #[async_trait::async_trait]
    impl OidcCodeClient for NoProvider {
        async fn redeem(&self, _settings: &OidcClientSettings, _code: &str) -> Result<CodeGrant> {
            Err(Error::OidcCodeRejected("invalid_grant".into()))
        }
    }

    fn authenticator(store: InMemoryPolicyStore) -> OidcAuthenticator {
        let keys = SigningKeyResolver::new(Arc::new(Unreachable), &KeyCacheConfig::default());
        OidcAuthenticator::new(
            Arc::new(store),
            Arc::new(keys),
            Arc::new(NoProvider),
            Duration::from_secs(60),
        )
    }

    fn ws() -> Webservice {
        Webservice::parse("acme", "authn-oidc/okta").unwrap()
    }

    fn input(body: &str) -> AuthenticatorInput {
        AuthenticatorInput::new("authn-oidc", Some("okta".into()), "acme", None, Credential::new(body.to_string()))
    }

    #[tokio::test]
    async fn missing_id_token_is_bad_request() {
        // GIVEN: no client-id, so the ID token flow applies
        let authn = authenticator(InMemoryPolicyStore::new());

        // THEN
        let err = authn.verify(&input("code=abc")).await.unwrap_err();
        assert!(matches!(err, Error::MissingRequestParam(ref p) if p == "id_token"));
    }

    #[tokio::test]
    async fn status_requires_provider_and_user_property() {
        let store = InMemoryPolicyStore::new();
        store.set_secret(ws().variable_id(PROVIDER_URI_VARIABLE), Some("https://okta.example.com".into()));
        let authn = authenticator(store);

        assert!(matches!(
            authn.status(&ws()).await,
            Err(Error::RequiredResourceMissing(_))
        ));
    }

    #[tokio::test]
    async fn status_passes_without_contacting_provider() {
        let store = InMemoryPolicyStore::new();
        store.set_secret(ws().variable_id(PROVIDER_URI_VARIABLE), Some("https://okta.example.com".into()));
        store.set_secret(ws().variable_id(USER_PROPERTY_VARIABLE), Some("preferred_username".into()));
        let authn = authenticator(store);

        assert!(authn.status(&ws()).await.is_ok());
    }

    #[tokio::test]
    async fn code_flow_status_requires_client_credentials() {
        // GIVEN: a client id without a secret or redirect URI
        let store = InMemoryPolicyStore::new();
        store.set_secret(ws().variable_id(PROVIDER_URI_VARIABLE), Some("https://okta.example.com".into()));
        store.set_secret(ws().variable_id(CLIENT_ID_VARIABLE), Some("conjur".into()));
        let authn = authenticator(store);

        // THEN
        let err = authn.status(&ws()).await.unwrap_err();
        assert!(matches!(err, Error::RequiredResourceMissing(ref id) if id.ends_with("client-secret")));
    }

    #[tokio::test]
    async fn code_flow_rejects_a_malformed_redirect_uri() {
        let store = InMemoryPolicyStore::new();
        for (name, value) in [
            (PROVIDER_URI_VARIABLE, "https://okta.example.com"),
            (CLIENT_ID_VARIABLE, "conjur"),
            (CLIENT_SECRET_VARIABLE, "s3cret"),
            (REDIRECT_URI_VARIABLE, "not a uri"),
        ] {
            store.set_secret(ws().variable_id(name), Some(value.into()));
        }
        let authn = authenticator(store);

        assert!(matches!(authn.status(&ws()).await, Err(Error::InvalidUri { .. })));
    }

    #[test]
    fn client_settings_debug_hides_the_secret() {
        let settings = OidcClientSettings {
            provider_uri: Url::parse("https://okta.example.com").unwrap(),
            client_id: "conjur".into(),
            client_secret: "s3cret".into(),
            redirect_uri: Url::parse("https://app.example.com/cb").unwrap(),
        };
        assert!(!format!("{settings:?}").contains("s3cret"));
    }
}
