//! Authenticator core value types.
//!
//! Two identifiers flow through every layer of the authenticator core:
//!
//! - [`ResourceId`]: the `account:kind:id` triple naming a role, webservice or
//!   variable in the policy store.
//! - [`Webservice`]: one configured authenticator instance, written as
//!   `authn-jwt/my-service` in configuration and stored in policy as
//!   `account:webservice:conjur/authn-jwt/my-service`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the built-in authenticator. It is always installed and needs no
/// webservice in policy.
pub const DEFAULT_AUTHENTICATOR: &str = "authn";

/// Authenticator types configured by a single webservice without service id.
pub const SERVICELESS_AUTHENTICATORS: [&str; 2] = [DEFAULT_AUTHENTICATOR, "authn-gcp"];

/// Identity type prefix for machine identities (`host/...`).
pub const HOST_PREFIX: &str = "host/";

/// Parse errors for identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A resource id that is not an `account:kind:id` triple.
    #[error("Invalid resource id '{0}': expected account:kind:id")]
    InvalidResourceId(String),

    /// A webservice name with an empty authenticator type.
    #[error("Invalid webservice name '{0}'")]
    InvalidWebservice(String),

    /// A non-default authenticator named without a service id.
    #[error("Service id is required for authenticator '{0}'")]
    ServiceIdMissing(String),
}

// ── ResourceId ────────────────────────────────────────────────────────────

/// Fully qualified policy identifier: `account:kind:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    account: String,
    kind: String,
    id: String,
}

impl ResourceId {
    /// Build from parts.
    pub fn new(account: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Role id for a login name: `host/<id>` names a host, anything else a user.
    #[must_use]
    pub fn from_username(account: &str, username: &str) -> Self {
        match username.strip_prefix(HOST_PREFIX) {
            Some(host) => Self::new(account, "host", host),
            None => Self::new(account, "user", username),
        }
    }

    /// The `admin` user of an account. Its presence marks the account as defined.
    #[must_use]
    pub fn admin(account: &str) -> Self {
        Self::new(account, "user", "admin")
    }

    /// Account part.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Kind part (`user`, `host`, `webservice`, `variable`, ...).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Identifier part.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Login name this role authenticates as (`host/<id>` for hosts).
    #[must_use]
    pub fn login(&self) -> String {
        if self.kind == "host" {
            format!("{HOST_PREFIX}{}", self.id)
        } else {
            self.id.clone()
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.account, self.kind, self.id)
    }
}

impl FromStr for ResourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(account), Some(kind), Some(id))
                if !account.is_empty() && !kind.is_empty() && !id.is_empty() =>
            {
                Ok(Self::new(account, kind, id))
            }
            _ => Err(ParseError::InvalidResourceId(s.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.to_string()
    }
}

// ── Webservice ────────────────────────────────────────────────────────────

/// One configured authenticator instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Webservice {
    account: String,
    authenticator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_id: Option<String>,
}

impl Webservice {
    /// Build a webservice. A blank service id counts as absent.
    ///
    /// # Errors
    ///
    /// [`ParseError::InvalidWebservice`] for a blank authenticator type and
    /// [`ParseError::ServiceIdMissing`] when a type outside
    /// [`SERVICELESS_AUTHENTICATORS`] has no service id.
    pub fn new(
        account: impl Into<String>,
        authenticator: impl Into<String>,
        service_id: Option<String>,
    ) -> Result<Self, ParseError> {
        let authenticator = authenticator.into();
        let authenticator = authenticator.trim().to_string();
        if authenticator.is_empty() {
            return Err(ParseError::InvalidWebservice(authenticator));
        }

        let service_id = service_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if service_id.is_none() && !SERVICELESS_AUTHENTICATORS.contains(&authenticator.as_str()) {
            return Err(ParseError::ServiceIdMissing(authenticator));
        }

        Ok(Self {
            account: account.into(),
            authenticator,
            service_id,
        })
    }

    /// Parse `type` or `type/service_id`.
    pub fn parse(account: &str, name: &str) -> Result<Self, ParseError> {
        let name = name.trim();
        match name.split_once('/') {
            Some((authenticator, service_id)) => {
                Self::new(account, authenticator, Some(service_id.to_string()))
            }
            None => Self::new(account, name, None),
        }
    }

    /// Parse a comma-separated list of webservice names. Blank entries are skipped.
    pub fn parse_list(account: &str, value: &str) -> Result<Vec<Self>, ParseError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Self::parse(account, s))
            .collect()
    }

    /// Account owning this webservice.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Authenticator type, e.g. `authn-jwt`.
    pub fn authenticator(&self) -> &str {
        &self.authenticator
    }

    /// Service id, absent only for the default authenticator.
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// Whether this is the built-in default authenticator.
    pub fn is_default(&self) -> bool {
        self.authenticator == DEFAULT_AUTHENTICATOR
    }

    /// `type/service_id`, or just `type` without a service id.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.service_id {
            Some(id) => format!("{}/{id}", self.authenticator),
            None => self.authenticator.clone(),
        }
    }

    /// Policy resource backing this webservice.
    #[must_use]
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(&self.account, "webservice", format!("conjur/{}", self.name()))
    }

    /// Resource guarding the status endpoint of this webservice.
    #[must_use]
    pub fn status_resource_id(&self) -> ResourceId {
        ResourceId::new(
            &self.account,
            "webservice",
            format!("conjur/{}/status", self.name()),
        )
    }

    /// Variable holding one configuration value of this webservice.
    #[must_use]
    pub fn variable_id(&self, variable: &str) -> ResourceId {
        ResourceId::new(
            &self.account,
            "variable",
            format!("conjur/{}/{variable}", self.name()),
        )
    }
}

impl fmt::Display for Webservice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_round_trips_through_display() {
        // GIVEN: an id whose identifier part contains colons
        let id: ResourceId = "acme:variable:conjur/authn-jwt/svc:x".parse().unwrap();

        // THEN: only the first two colons split
        assert_eq!(id.account(), "acme");
        assert_eq!(id.kind(), "variable");
        assert_eq!(id.id(), "conjur/authn-jwt/svc:x");
        assert_eq!(id.to_string(), "acme:variable:conjur/authn-jwt/svc:x");
    }

    #[test]
    fn resource_id_rejects_short_form() {
        assert!("acme:user".parse::<ResourceId>().is_err());
        assert!("acme::alice".parse::<ResourceId>().is_err());
    }

    #[test]
    fn username_maps_to_host_or_user() {
        assert_eq!(
            ResourceId::from_username("acme", "host/apps/ci").to_string(),
            "acme:host:apps/ci"
        );
        assert_eq!(
            ResourceId::from_username("acme", "alice").to_string(),
            "acme:user:alice"
        );
        assert_eq!(ResourceId::new("acme", "host", "apps/ci").login(), "host/apps/ci");
    }

    #[test]
    fn webservice_requires_service_id_except_default() {
        // GIVEN/WHEN: a JWT authenticator without service id
        let err = Webservice::parse("acme", "authn-jwt").unwrap_err();

        // THEN: rejected
        assert_eq!(err, ParseError::ServiceIdMissing("authn-jwt".into()));

        // AND: the default authenticator is fine without one
        let default = Webservice::parse("acme", "authn").unwrap();
        assert!(default.is_default());
        assert_eq!(default.service_id(), None);

        // AND: so is GCP, which is not the default
        let gcp = Webservice::parse("acme", "authn-gcp").unwrap();
        assert!(!gcp.is_default());
        assert_eq!(gcp.resource_id().to_string(), "acme:webservice:conjur/authn-gcp");
    }

    #[test]
    fn webservice_ids_follow_policy_layout() {
        let ws = Webservice::parse("acme", "authn-jwt/gitlab").unwrap();

        assert_eq!(ws.name(), "authn-jwt/gitlab");
        assert_eq!(ws.resource_id().to_string(), "acme:webservice:conjur/authn-jwt/gitlab");
        assert_eq!(
            ws.status_resource_id().to_string(),
            "acme:webservice:conjur/authn-jwt/gitlab/status"
        );
        assert_eq!(
            ws.variable_id("jwks-uri").to_string(),
            "acme:variable:conjur/authn-jwt/gitlab/jwks-uri"
        );
    }

    #[test]
    fn parse_list_skips_blank_entries() {
        // GIVEN: an allow-list with stray separators and whitespace
        let list = Webservice::parse_list("acme", " authn, ,authn-jwt/a ,authn-oidc/b,").unwrap();

        // THEN: three entries in order
        let names: Vec<String> = list.iter().map(Webservice::name).collect();
        assert_eq!(names, vec!["authn", "authn-jwt/a", "authn-oidc/b"]);
    }

    #[test]
    fn blank_service_id_counts_as_absent() {
        let err = Webservice::new("acme", "authn-jwt", Some("  ".into())).unwrap_err();
        assert_eq!(err, ParseError::ServiceIdMissing("authn-jwt".into()));
    }

    #[test]
    fn resource_id_serializes_as_string() {
        let id = ResourceId::new("acme", "host", "ci");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"acme:host:ci\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
