//! Strategy dispatch and the boundary operations.
//!
//! [`AuthenticationStrategy`] owns the registry, the security pipeline, the
//! token factory and the audit sink. It is the only entry point the HTTP layer
//! and the CLI use.
//!
//! ```text
//! authenticate: registry lookup → security (1-3, 4-5 for a URL username)
//!               → strategy verify → security (4-5 for a token identity)
//!               → token issue → one audit event
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use authn_types::{DEFAULT_AUTHENTICATOR, ResourceId, Webservice};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::authenticators::{
    DefaultAuthenticator, DirectoryBinder, GcpAuthenticator, HttpOidcClient, K8sAuthenticator,
    K8sObjectLookup, LdapAuthenticator, OidcAuthenticator, OidcCodeClient, RoleIdentity,
};
use crate::config::Config;
use crate::input::{self, AuthenticatorInput};
use crate::jwt::JwtAuthenticator;
use crate::jwt::key_cache::SigningKeyResolver;
use crate::jwt::restrictions::{ClaimRestrictionMatcher, RestrictionMatcher};
use crate::jwt::signing_key::HttpKeySource;
use crate::policy::{CredentialStore, PolicyStore, READ_PRIVILEGE, UPDATE_PRIVILEGE};
use crate::registry::{AuthenticatorList, AuthenticatorRegistry};
use crate::security::SecurityValidator;
use crate::token::{AccessToken, HmacTokenFactory, TokenFactory};
use crate::{Error, Result};

/// Collaborators of an [`AuthenticationStrategy`].
pub struct StrategyParts {
    /// Installed authenticators and allow-list.
    pub registry: Arc<AuthenticatorRegistry>,
    /// Policy engine.
    pub store: Arc<dyn PolicyStore>,
    /// Password exchange for `login`.
    pub default_authenticator: Arc<DefaultAuthenticator>,
    /// Access token issuance.
    pub tokens: Arc<dyn TokenFactory>,
    /// Audit destination.
    pub audit: Arc<dyn AuditSink>,
    /// Deadline for one `authenticate` call.
    pub request_timeout: Duration,
    /// Account used when a request does not name one.
    pub default_account: String,
}

/// Clients of external systems some authenticators need.
///
/// `authn-ldap` and `authn-k8s` are installed only when their client is given.
/// `authn-oidc` redeems authorization codes over HTTP unless a client is given.
#[derive(Clone, Default)]
pub struct Integrations {
    /// Directory for `authn-ldap`.
    pub directory: Option<Arc<dyn DirectoryBinder>>,
    /// Kubernetes API for `authn-k8s`.
    pub kubernetes: Option<Arc<dyn K8sObjectLookup>>,
    /// Provider client for the `authn-oidc` authorization-code flow.
    pub oidc: Option<Arc<dyn OidcCodeClient>>,
}

/// Runs the boundary operations.
pub struct AuthenticationStrategy {
    registry: Arc<AuthenticatorRegistry>,
    security: SecurityValidator,
    store: Arc<dyn PolicyStore>,
    default_authenticator: Arc<DefaultAuthenticator>,
    tokens: Arc<dyn TokenFactory>,
    audit: Arc<dyn AuditSink>,
    request_timeout: Duration,
    default_account: String,
}

impl AuthenticationStrategy {
    /// Assemble from explicit collaborators.
    pub fn new(parts: StrategyParts) -> Self {
        let security = SecurityValidator::new(Arc::clone(&parts.store), parts.registry.enabled().clone());
        Self {
            registry: parts.registry,
            security,
            store: parts.store,
            default_authenticator: parts.default_authenticator,
            tokens: parts.tokens,
            audit: parts.audit,
            request_timeout: parts.request_timeout,
            default_account: parts.default_account,
        }
    }

    /// Account used when a request does not name one.
    pub fn default_account(&self) -> &str {
        &self.default_account
    }

    /// Wire every installed authenticator from configuration.
    ///
    /// See [`Integrations`] for the authenticators that depend on external clients.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid allow-list, token key or HTTP client.
    pub fn from_config<S>(
        config: &Config,
        store: Arc<S>,
        integrations: Integrations,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self>
    where
        S: PolicyStore + CredentialStore,
    {
        let policy: Arc<dyn PolicyStore> = store.clone();
        let credentials: Arc<dyn CredentialStore> = store;

        let keys = Arc::new(SigningKeyResolver::new(
            Arc::new(HttpKeySource::new(&config.http)?),
            &config.key_cache,
        ));
        let matcher: Arc<dyn RestrictionMatcher> = Arc::new(ClaimRestrictionMatcher);
        let leeway = config.jwt.leeway;
        let default_authenticator = Arc::new(DefaultAuthenticator::new(credentials));
        let oidc_client: Arc<dyn OidcCodeClient> = match integrations.oidc {
            Some(client) => client,
            None => Arc::new(HttpOidcClient::new(&config.http)?),
        };

        let mut registry = AuthenticatorRegistry::new(&config.enabled_webservices(&config.account)?)
            .with(default_authenticator.clone())
            .with(Arc::new(JwtAuthenticator::new(
                Arc::clone(&policy),
                Arc::clone(&keys),
                Arc::clone(&matcher),
                leeway,
            )))
            .with(Arc::new(OidcAuthenticator::new(
                Arc::clone(&policy),
                Arc::clone(&keys),
                oidc_client,
                leeway,
            )))
            .with(Arc::new(GcpAuthenticator::new(
                Arc::clone(&policy),
                keys,
                matcher,
                leeway,
            )?));
        if let Some(directory) = integrations.directory {
            registry = registry.with(Arc::new(LdapAuthenticator::new(directory)));
        }
        if let Some(kubernetes) = integrations.kubernetes {
            registry = registry.with(Arc::new(K8sAuthenticator::new(Arc::clone(&policy), kubernetes)));
        }

        let strategy = Self::new(StrategyParts {
            registry: Arc::new(registry),
            store: policy,
            default_authenticator,
            tokens: Arc::new(HmacTokenFactory::from_config(&config.token)?),
            audit,
            request_timeout: config.request_timeout,
            default_account: config.account.clone(),
        });
        info!(
            installed = ?strategy.registry.installed(),
            enabled = ?strategy.registry.enabled(),
            "Authenticators ready"
        );
        Ok(strategy)
    }

    /// Verify a credential and issue an access token.
    ///
    /// Exactly one audit event is recorded, whatever the outcome. The whole
    /// call is bounded by the request timeout; on expiry in-flight outbound
    /// calls are dropped.
    pub async fn authenticate(&self, input: &AuthenticatorInput) -> Result<AccessToken> {
        let outcome = tokio::time::timeout(self.request_timeout, self.run_authenticate(input))
            .await
            .unwrap_or(Err(Error::RequestTimeout(self.request_timeout)));

        let service = input.webservice().ok().map(|ws| ws.resource_id().to_string());
        let event = match &outcome {
            Ok((identity, _)) => AuditEvent::authentication(
                input.authenticator_name(),
                service,
                Some(identity.role_id.to_string()),
                true,
                None,
            ),
            Err(e) => {
                warn!(
                    authenticator = input.authenticator_name(),
                    service = service.as_deref().unwrap_or("-"),
                    error = %e,
                    "Authentication rejected"
                );
                AuditEvent::authentication(
                    input.authenticator_name(),
                    service,
                    input.claimed_role().map(|r| r.to_string()),
                    false,
                    Some(e.to_string()),
                )
            }
        };
        self.audit.record(event.with_client_ip(input.origin()));

        outcome.map(|(_, token)| token)
    }

    async fn run_authenticate(&self, input: &AuthenticatorInput) -> Result<(RoleIdentity, AccessToken)> {
        let authenticator = self.registry.get(input.authenticator_name())?;
        let webservice = input.webservice()?;
        let claimed = input.claimed_role();

        self.security.validate(&webservice, claimed.as_ref()).await?;
        let identity = authenticator.verify(input).await?;
        if claimed.as_ref() != Some(&identity.role_id) {
            self.security.validate_role(&webservice, &identity.role_id).await?;
        }

        let token = self.tokens.issue(&identity)?;
        debug!(webservice = %webservice, role = %identity.role_id, "Access token issued");
        Ok((identity, token))
    }

    /// Configuration-only health check of one webservice.
    ///
    /// When `caller` is given it must hold `read` on the webservice's status
    /// resource. No credential is verified and no network call is made.
    pub async fn status(
        &self,
        authenticator_name: &str,
        account: &str,
        service_id: Option<String>,
        caller: Option<&ResourceId>,
    ) -> Result<()> {
        let authenticator = self.registry.get(authenticator_name)?;
        let webservice = input::webservice(account, authenticator_name, service_id)?;
        if webservice.is_default() {
            return Ok(());
        }

        if let Some(caller) = caller {
            self.security
                .require_privilege(caller, READ_PRIVILEGE, &webservice.status_resource_id())
                .await?;
        }
        self.security.validate_webservice(&webservice).await?;
        authenticator.status(&webservice).await?;
        debug!(webservice = %webservice, "Status ok");
        Ok(())
    }

    /// Exchange a password (or API key) for the role's API key.
    ///
    /// Only the default authenticator supports `login`. Every call is audited,
    /// including a wrong authenticator or absent credentials.
    pub async fn login(
        &self,
        authenticator: &str,
        account: &str,
        credentials: Option<(&str, &str)>,
        origin: Option<IpAddr>,
    ) -> Result<String> {
        let role = credentials.map(|(username, _)| ResourceId::from_username(account, username));
        let outcome = match (role.as_ref(), credentials) {
            _ if authenticator != DEFAULT_AUTHENTICATOR => {
                Err(Error::AuthenticatorNotFound(authenticator.to_string()))
            }
            (Some(role), Some((_, password))) => self.run_login(account, role, password).await,
            _ => Err(Error::MissingRequestParam("authorization".to_string())),
        };

        let event = AuditEvent::login(
            authenticator,
            role.as_ref().map(ToString::to_string),
            outcome.is_ok(),
            outcome.as_ref().err().map(ToString::to_string),
        );
        self.audit.record(event.with_client_ip(origin));
        outcome
    }

    async fn run_login(&self, account: &str, role: &ResourceId, password: &str) -> Result<String> {
        self.registry.get(DEFAULT_AUTHENTICATOR)?;
        let webservice = input::webservice(account, DEFAULT_AUTHENTICATOR, None)?;
        self.security.validate(&webservice, Some(role)).await?;
        self.default_authenticator.login(role, password).await
    }

    /// Installed, configured and enabled authenticators for `account`.
    pub async fn list_authenticators(&self, account: &str) -> Result<AuthenticatorList> {
        self.registry.list(self.store.as_ref(), account).await
    }

    /// Materialize a webservice and its variables on behalf of the holder of
    /// `access_token`, who needs `update` on the account's root policy.
    ///
    /// A duplicate surfaces as [`Error::ConcurrentLoad`]; the caller owns the retry.
    pub async fn create_webservice(
        &self,
        access_token: &str,
        webservice: &Webservice,
        variables: BTreeMap<String, String>,
    ) -> Result<()> {
        let caller = self.caller(access_token)?;
        let root = ResourceId::new(webservice.account(), "policy", "root");
        self.security
            .require_privilege(&caller, UPDATE_PRIVILEGE, &root)
            .await?;

        self.store.create_webservice(webservice, variables).await?;
        info!(webservice = %webservice, caller = %caller, "Webservice created");
        Ok(())
    }

    /// Role named by a valid access token.
    pub fn caller(&self, access_token: &str) -> Result<ResourceId> {
        let claims = self.tokens.verify(access_token)?;
        claims
            .sub
            .parse()
            .map_err(|_| Error::MalformedToken("access token subject".to_string()))
    }
}
