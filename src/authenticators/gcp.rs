//! `authn-gcp`: Google-signed instance identity tokens.
//!
//! The token audience names the host: `conjur/<account>/<host-id>`. The host
//! must carry at least one `authn-gcp/` annotation, drawn from a fixed set,
//! and every annotation must match its token claim.

use std::sync::Arc;
use std::time::Duration;

use authn_types::{ResourceId, Webservice};
use tracing::debug;
use url::Url;

use super::{Authenticator, RoleIdentity};
use crate::input::AuthenticatorInput;
use crate::jwt::claims::{ClaimAliasMap, ClaimsValidator};
use crate::jwt::key_cache::SigningKeyResolver;
use crate::jwt::restrictions::{ResourceRestriction, RestrictionMatcher};
use crate::jwt::signing_key::SigningKeyConfig;
use crate::jwt::verify::verify_with_refresh;
use crate::jwt::JWT_PARAM;
use crate::policy::PolicyStore;
use crate::{Error, Result};

/// Authenticator type name.
pub const AUTHENTICATOR_NAME: &str = "authn-gcp";

/// Google's token signing keys.
pub const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Issuer of Google identity tokens.
pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";

/// Annotation prefix for GCP restrictions.
pub const ANNOTATION_PREFIX: &str = "authn-gcp/";

/// Permitted restrictions and the token claim each one reads.
pub const PERMITTED_CONSTRAINTS: [(&str, &str); 4] = [
    ("project-id", "google/compute_engine/project_id"),
    ("instance-name", "google/compute_engine/instance_name"),
    ("service-account-id", "sub"),
    ("service-account-email", "email"),
];

/// The `authn-gcp` authenticator.
pub struct GcpAuthenticator {
    store: Arc<dyn PolicyStore>,
    keys: Arc<SigningKeyResolver>,
    matcher: Arc<dyn RestrictionMatcher>,
    key_config: SigningKeyConfig,
    leeway: Duration,
}

impl GcpAuthenticator {
    /// Create with explicit collaborators, verifying against Google's keys.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUri`] if the fixed JWKS URI does not parse.
    pub fn new(
        store: Arc<dyn PolicyStore>,
        keys: Arc<SigningKeyResolver>,
        matcher: Arc<dyn RestrictionMatcher>,
        leeway: Duration,
    ) -> Result<Self> {
        let jwks_uri = Url::parse(GOOGLE_JWKS_URI).map_err(|e| Error::InvalidUri {
            variable: "jwks-uri".to_string(),
            cause: e.to_string(),
        })?;
        Ok(Self::with_key_config(
            store,
            keys,
            matcher,
            SigningKeyConfig::JwksUri(jwks_uri),
            leeway,
        ))
    }

    /// Create with an explicit key source configuration.
    pub fn with_key_config(
        store: Arc<dyn PolicyStore>,
        keys: Arc<SigningKeyResolver>,
        matcher: Arc<dyn RestrictionMatcher>,
        key_config: SigningKeyConfig,
        leeway: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            matcher,
            key_config,
            leeway,
        }
    }

    async fn restrictions(&self, role: &ResourceId) -> Result<Vec<ResourceRestriction>> {
        let annotations = self
            .store
            .annotations(role)
            .await?
            .ok_or_else(|| Error::UserNotDefined(role.to_string()))?;

        let restrictions: Vec<ResourceRestriction> = annotations
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(ANNOTATION_PREFIX)
                    .map(|name| ResourceRestriction::new(name, value))
            })
            .collect();
        validate_constraints(&restrictions)?;
        Ok(restrictions)
    }
}

fn permitted_names() -> String {
    PERMITTED_CONSTRAINTS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// At least one restriction, each one permitted.
fn validate_constraints(restrictions: &[ResourceRestriction]) -> Result<()> {
    if restrictions.is_empty() {
        return Err(Error::RoleMissingRequiredConstraints(permitted_names()));
    }
    for restriction in restrictions {
        if !PERMITTED_CONSTRAINTS.iter().any(|(name, _)| *name == restriction.name()) {
            return Err(Error::ConstraintNotSupported {
                constraint: restriction.name().to_string(),
                permitted: permitted_names(),
            });
        }
    }
    Ok(())
}

/// `conjur/<account>/<host-id>` → `<host-id>`.
fn host_from_audience(account: &str, audience: &str) -> Result<String> {
    let prefix = format!("conjur/{account}/");
    audience
        .strip_prefix(&prefix)
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidAudience(format!("{prefix}<host-id>")))
}

#[async_trait::async_trait]
impl Authenticator for GcpAuthenticator {
    fn name(&self) -> &'static str {
        AUTHENTICATOR_NAME
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity> {
        let webservice = input.webservice()?;
        let token = input
            .credential()
            .form_param(JWT_PARAM)
            .ok_or_else(|| Error::MissingRequestParam(JWT_PARAM.to_string()))?;

        let (decoded, _) =
            verify_with_refresh(&self.keys, &webservice, &self.key_config, &token, self.leeway).await?;
        ClaimsValidator {
            issuer: Some(GOOGLE_ISSUER.to_string()),
            leeway: self.leeway,
            ..ClaimsValidator::default()
        }
        .validate_standard(&decoded)?;

        let audience = decoded
            .lookup_string("aud")
            .ok_or_else(|| Error::MissingMandatoryClaim("aud".to_string()))?;
        let username = host_from_audience(webservice.account(), &audience)?;
        let role = ResourceId::from_username(webservice.account(), &username);

        let restrictions = self.restrictions(&role).await?;
        let aliases = ClaimAliasMap::from_pairs(PERMITTED_CONSTRAINTS);
        let report = self.matcher.evaluate(&restrictions, &decoded, &aliases)?;
        if let Some(name) = report.unsatisfied.first() {
            return Err(Error::InvalidResourceRestrictions(name.clone()));
        }

        debug!(webservice = %webservice, role = %role, "GCP identity token verified");
        Ok(RoleIdentity::new(role))
    }

    async fn status(&self, _webservice: &Webservice) -> Result<()> {
        Ok(())
    }
}
