//! JWT authenticator (`authn-jwt`).
//!
//! # Verification flow
//!
//! 1. Read webservice configuration: key source, identity source, issuer,
//!    audience, enforced claims and claim aliases. Configuration errors surface
//!    before any network call.
//! 2. Resolve the signing keys through the shared cache and verify the token,
//!    refreshing once on a key mismatch.
//! 3. Check `iat`, `iss` and `aud`.
//! 4. Resolve the identity (URL or token claim).
//! 5. Read the role's restrictions, check enforced-claims coverage, then match
//!    every restriction against the token.

pub mod claims;
pub mod identity;
pub mod key_cache;
pub mod refresh_guard;
pub mod restrictions;
pub mod signing_key;
pub mod verify;

use std::sync::Arc;
use std::time::Duration;

use authn_types::{ResourceId, Webservice};
use tracing::{debug, warn};

use crate::authenticators::{Authenticator, RoleIdentity};
use crate::input::AuthenticatorInput;
use crate::policy::PolicyStore;
use crate::secrets::WebserviceSecrets;
use crate::{Error, Result};

use claims::{ClaimAliasMap, ClaimPath, ClaimsValidator, parse_enforced_claims};
use identity::{IdentityConfig, TokenFieldSettings};
use key_cache::SigningKeyResolver;
use restrictions::{RestrictionMatcher, extract_restrictions, validate_restriction_names};
use signing_key::SigningKeyConfig;

/// Authenticator type name.
pub const AUTHENTICATOR_NAME: &str = "authn-jwt";

/// OIDC provider URI variable.
pub const PROVIDER_URI_VARIABLE: &str = "provider-uri";
/// JWKS URI variable.
pub const JWKS_URI_VARIABLE: &str = "jwks-uri";
/// Expected issuer variable.
pub const ISSUER_VARIABLE: &str = "issuer";
/// Required audience variable.
pub const AUDIENCE_VARIABLE: &str = "audience";
/// Identity claim variable.
pub const TOKEN_APP_PROPERTY_VARIABLE: &str = "token-app-property";
/// Identity namespace variable.
pub const IDENTITY_PATH_VARIABLE: &str = "identity-path";
/// Enforced claims variable.
pub const ENFORCED_CLAIMS_VARIABLE: &str = "enforced-claims";
/// Claim aliases variable.
pub const CLAIM_ALIASES_VARIABLE: &str = "claim-aliases";

/// Form field carrying the token.
pub const JWT_PARAM: &str = "jwt";

/// Claim configuration of one webservice, read once per request.
#[derive(Debug, Clone, Default)]
pub struct JwtSettings {
    /// `issuer` variable
    pub issuer: Option<String>,
    /// `audience` variable
    pub audience: Option<String>,
    /// Parsed `enforced-claims`
    pub enforced: Vec<ClaimPath>,
    /// Parsed `claim-aliases`
    pub aliases: ClaimAliasMap,
    /// Token-field identity, when configured
    pub token_field: Option<TokenFieldSettings>,
}

impl JwtSettings {
    /// Read and parse every optional variable.
    ///
    /// # Errors
    ///
    /// Format errors from the claim lists, identity errors from
    /// [`TokenFieldSettings::read`], and [`Error::RequiredSecretMissing`] for a
    /// variable declared without a value.
    pub async fn read(secrets: &WebserviceSecrets<'_>) -> Result<Self> {
        let issuer = non_blank(secrets.optional(ISSUER_VARIABLE).await?);
        let audience = non_blank(secrets.optional(AUDIENCE_VARIABLE).await?);

        let enforced = match non_blank(secrets.optional(ENFORCED_CLAIMS_VARIABLE).await?) {
            Some(value) => parse_enforced_claims(&value)?,
            None => Vec::new(),
        };
        let aliases = match non_blank(secrets.optional(CLAIM_ALIASES_VARIABLE).await?) {
            Some(value) => ClaimAliasMap::parse(&value)?,
            None => ClaimAliasMap::default(),
        };
        let token_field = TokenFieldSettings::read(secrets).await?;

        Ok(Self {
            issuer,
            audience,
            enforced,
            aliases,
            token_field,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Service ids of the other webservices of the same type.
pub(crate) async fn sibling_service_ids(
    store: &dyn PolicyStore,
    webservice: &Webservice,
) -> Result<Vec<String>> {
    Ok(store
        .webservices(webservice.account())
        .await?
        .into_iter()
        .filter(|ws| ws.authenticator() == webservice.authenticator() && ws != webservice)
        .filter_map(|ws| ws.service_id().map(str::to_string))
        .collect())
}

/// The `authn-jwt` authenticator.
pub struct JwtAuthenticator {
    store: Arc<dyn PolicyStore>,
    keys: Arc<SigningKeyResolver>,
    matcher: Arc<dyn RestrictionMatcher>,
    leeway: Duration,
}

impl JwtAuthenticator {
    /// Create with explicit collaborators.
    pub fn new(
        store: Arc<dyn PolicyStore>,
        keys: Arc<SigningKeyResolver>,
        matcher: Arc<dyn RestrictionMatcher>,
        leeway: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            matcher,
            leeway,
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for JwtAuthenticator {
    fn name(&self) -> &'static str {
        AUTHENTICATOR_NAME
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity> {
        let webservice = input.webservice()?;
        let token = input
            .credential()
            .form_param(JWT_PARAM)
            .ok_or_else(|| Error::MissingRequestParam(JWT_PARAM.to_string()))?;

        let secrets = WebserviceSecrets::new(self.store.as_ref(), &webservice);
        let key_config = SigningKeyConfig::resolve(&secrets).await?;
        let settings = JwtSettings::read(&secrets).await?;
        let identity = IdentityConfig::select(&webservice.name(), settings.token_field.clone(), input.username())?;

        let (decoded, keys) =
            verify::verify_with_refresh(&self.keys, &webservice, &key_config, &token, self.leeway).await?;

        let validator = ClaimsValidator {
            issuer: settings
                .issuer
                .or_else(|| keys.keys.issuer.clone())
                .or_else(|| Some(key_config.default_issuer())),
            audience: settings.audience,
            enforced: settings.enforced,
            aliases: settings.aliases,
            leeway: self.leeway,
        };
        validator.validate_standard(&decoded)?;

        let username = identity.provider().identity(&decoded)?;
        let role = ResourceId::from_username(webservice.account(), &username);

        let siblings = sibling_service_ids(self.store.as_ref(), &webservice).await?;
        let restrictions = extract_restrictions(self.store.as_ref(), &webservice, &role, &siblings)
            .await
            .map_err(|e| match e {
                Error::RoleNotFound(role) => Error::UserNotDefined(role),
                other => other,
            })?;
        validate_restriction_names(&restrictions, &validator.aliases)?;
        validator.validate_enforced(&restrictions)?;

        let report = self.matcher.evaluate(&restrictions, &decoded, &validator.aliases)?;
        if let Some(name) = report.unsatisfied.first() {
            warn!(
                webservice = %webservice,
                role = %role,
                restriction = %name,
                "Resource restriction not satisfied"
            );
            return Err(Error::InvalidResourceRestrictions(name.clone()));
        }

        debug!(webservice = %webservice, role = %role, "JWT verified");
        Ok(RoleIdentity::new(role))
    }

    async fn status(&self, webservice: &Webservice) -> Result<()> {
        let secrets = WebserviceSecrets::new(self.store.as_ref(), webservice);
        SigningKeyConfig::resolve(&secrets).await?;
        JwtSettings::read(&secrets).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::InMemoryPolicyStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn settings_read_every_claim_list() {
        // GIVEN: a webservice with all optional variables set
        let store = InMemoryPolicyStore::new();
        let ws = Webservice::parse("acme", "authn-jwt/gitlab").unwrap();
        store.set_secret(ws.variable_id(ISSUER_VARIABLE), Some("https://gitlab.example.com".into()));
        store.set_secret(ws.variable_id(AUDIENCE_VARIABLE), Some("conjur".into()));
        store.set_secret(ws.variable_id(ENFORCED_CLAIMS_VARIABLE), Some("ref, project_path".into()));
        store.set_secret(ws.variable_id(CLAIM_ALIASES_VARIABLE), Some("branch:ref".into()));
        store.set_secret(ws.variable_id(TOKEN_APP_PROPERTY_VARIABLE), Some("project_path".into()));

        // WHEN
        let settings = JwtSettings::read(&WebserviceSecrets::new(&store, &ws)).await.unwrap();

        // THEN
        assert_eq!(settings.issuer.as_deref(), Some("https://gitlab.example.com"));
        assert_eq!(settings.audience.as_deref(), Some("conjur"));
        assert_eq!(settings.enforced.len(), 2);
        assert_eq!(settings.aliases.resolve("branch"), ("ref", Some("branch")));
        assert!(settings.token_field.is_some());
    }

    #[tokio::test]
    async fn settings_surface_malformed_lists() {
        let store = InMemoryPolicyStore::new();
        let ws = Webservice::parse("acme", "authn-jwt/gitlab").unwrap();
        store.set_secret(ws.variable_id(CLAIM_ALIASES_VARIABLE), Some("a:b,,c:d".into()));

        let err = JwtSettings::read(&WebserviceSecrets::new(&store, &ws)).await.unwrap_err();
        assert!(matches!(err, Error::MappedClaimsBlankOrEmpty(_)));
    }

    #[tokio::test]
    async fn siblings_exclude_self_and_other_types() {
        let store = InMemoryPolicyStore::new();
        for name in ["authn-jwt/a", "authn-jwt/b", "authn-oidc/c"] {
            let ws = Webservice::parse("acme", name).unwrap();
            store.create_webservice(&ws, Default::default()).await.unwrap();
        }
        let a = Webservice::parse("acme", "authn-jwt/a").unwrap();

        let siblings = sibling_service_ids(&store, &a).await.unwrap();
        assert_eq!(siblings, vec!["b".to_string()]);
    }
}
