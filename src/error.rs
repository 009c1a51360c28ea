//! Error types for the authenticator core
//!
//! Every rejection is a typed [`Error`] variant carrying enough context (webservice,
//! claim, URI, cause) to be logged usefully. Credential material never appears in
//! an error. [`Error::kind`] groups variants into the transport intent the HTTP
//! boundary maps to a status code.

use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for the authenticator core
pub type Result<T> = std::result::Result<T, Error>;

/// Transport intent of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential or identity rejected.
    Unauthenticated,
    /// Identity is valid but lacks the privilege.
    Forbidden,
    /// A required request parameter is missing or malformed.
    BadRequest,
    /// Authenticator configuration is invalid.
    ConfigurationInvalid,
    /// An upstream dependency did not answer in time.
    UpstreamTimeout,
    /// An upstream dependency answered with an error.
    BadGateway,
    /// A local limit is saturated; retry later.
    ServiceUnavailable,
    /// Concurrent policy load; retry later.
    Conflict,
    /// Unexpected internal fault.
    Internal,
}

impl ErrorKind {
    /// HTTP status for this kind.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::ConfigurationInvalid => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable snake-case label used in JSON error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::BadRequest => "bad_request",
            Self::ConfigurationInvalid => "configuration_invalid",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::BadGateway => "bad_gateway",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

/// Authenticator core errors
#[derive(Error, Debug)]
pub enum Error {
    // ── Security validation ──────────────────────────────────────────────
    /// No admin role exists for the account.
    #[error("Account '{0}' is not defined")]
    AccountNotDefined(String),

    /// No policy resource backs the webservice.
    #[error("Webservice '{0}' is not defined")]
    ServiceNotDefined(String),

    /// The webservice is not in the operator allow-list.
    #[error("Authenticator '{0}' is not enabled")]
    NotWhitelisted(String),

    /// The claimed username does not resolve to a role.
    #[error("'{0}' is not defined")]
    UserNotDefined(String),

    /// The role lacks the privilege on the webservice.
    #[error("'{role}' does not have '{privilege}' privilege on {resource}")]
    UserNotAuthorized {
        /// Role id
        role: String,
        /// Privilege checked
        privilege: String,
        /// Resource id
        resource: String,
    },

    /// No installed implementation for the authenticator type.
    #[error("Authenticator '{0}' is not implemented")]
    AuthenticatorNotFound(String),

    /// A role whose restrictions were requested does not exist.
    #[error("Role '{0}' not found")]
    RoleNotFound(String),

    /// Service id missing on a request for a non-default authenticator.
    #[error("Service id is required for authenticator '{0}'")]
    ServiceIdMissing(String),

    /// A malformed account, webservice or role identifier.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] authn_types::ParseError),

    // ── Credentials ──────────────────────────────────────────────────────
    /// Username/password or API key rejected.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The token could not be parsed as a JWT.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The token is signed with an algorithm outside the accepted set.
    #[error("Signing algorithm '{0}' is not supported")]
    UnsupportedAlgorithm(String),

    /// No key in the key set verifies the signature.
    #[error("Token signature could not be verified")]
    InvalidSignature,

    /// The token names a key id not present in the key set.
    #[error("No signing key with kid '{0}'")]
    UnknownKeyId(String),

    /// `exp` is in the past.
    #[error("Token has expired")]
    TokenExpired,

    /// `nbf` is in the future.
    #[error("Token is not yet valid")]
    TokenNotYetValid,

    /// `iat` is in the future.
    #[error("Token was issued in the future")]
    TokenIssuedInFuture,

    /// A standard claim required by configuration is absent.
    #[error("Mandatory claim '{0}' is missing from the token")]
    MissingMandatoryClaim(String),

    /// `iss` does not match the expected issuer.
    #[error("Issuer mismatch: expected '{expected}', got '{actual}'")]
    InvalidIssuer {
        /// Expected issuer
        expected: String,
        /// Issuer found in the token
        actual: String,
    },

    /// `aud` does not contain the configured audience.
    #[error("Audience '{0}' not present in token")]
    InvalidAudience(String),

    /// The configured identity claim is absent or blank in the token.
    #[error("Claim '{0}' does not exist in the token or is empty")]
    NoSuchFieldInToken(String),

    /// A restriction value is blank.
    #[error("Annotation '{0}' is empty")]
    EmptyAnnotationGiven(String),

    /// A restriction names a claim missing from the token. The field holds the
    /// claim, annotated with the restriction name when an alias applied.
    #[error("Claim {0} is missing from JWT token")]
    JwtTokenClaimIsMissing(String),

    /// A restriction value does not match the token.
    #[error("Resource restriction '{0}' does not match the token")]
    InvalidResourceRestrictions(String),

    /// An enforced claim is not covered by any restriction on the role.
    #[error("Role must have an annotation for enforced claim '{0}'")]
    RoleMissingConstraint(String),

    /// A GCP role has no `authn-gcp/` restrictions.
    #[error("Role must have at least one of the constraints: {0}")]
    RoleMissingRequiredConstraints(String),

    /// A restriction type not supported by the authenticator.
    #[error("Constraint '{constraint}' is not supported (permitted: {permitted})")]
    ConstraintNotSupported {
        /// Offending constraint
        constraint: String,
        /// Permitted constraints, comma-joined
        permitted: String,
    },

    /// A restriction name is a deny-listed standard claim.
    #[error("Claim '{0}' cannot be used as a restriction")]
    RestrictionOnDeniedClaim(String),

    /// LDAP directory rejected or could not serve the bind.
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The provider refused the authorization code.
    #[error("Authorization code rejected by the provider: {0}")]
    OidcCodeRejected(String),

    /// Userinfo and ID token name different subjects.
    #[error("User info subject [{user_info}] and id token subject [{id_token}] are not equal")]
    OidcSubjectMismatch {
        /// `sub` from the userinfo endpoint
        user_info: String,
        /// `sub` from the ID token
        id_token: String,
    },

    /// Userinfo carries no `preferred_username`.
    #[error("[profile] is not included in scope of authorization code request")]
    OidcProfileScopeMissing,

    /// A call to the provider's token or userinfo endpoint failed.
    #[error("OIDC request to '{endpoint}' failed: {cause}")]
    OidcEndpointFailed {
        /// Endpoint URL
        endpoint: String,
        /// Underlying cause
        cause: String,
    },

    /// The request does not identify a pod.
    #[error("Invalid pod identity: {0}")]
    InvalidPodIdentity(String),

    /// The pod named by the request does not exist.
    #[error("No Pod found for podname {name} in namespace {namespace}")]
    PodNotFound {
        /// Pod name
        name: String,
        /// Pod namespace
        namespace: String,
    },

    /// An object on the pod's ownership chain does not exist.
    #[error("Kubernetes object {kind} '{name}' not found in namespace {namespace}")]
    K8sObjectNotFound {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
        /// Namespace
        namespace: String,
    },

    /// The pod does not belong to the host's application.
    #[error("{0}")]
    PodRelationMismatch(String),

    /// The pod runs in another namespace than the host's.
    #[error("Namespace in the request [{actual}] does not match the host namespace [{expected}]")]
    NamespaceMismatch {
        /// Host namespace
        expected: String,
        /// Pod namespace
        actual: String,
    },

    /// The host names a controller type that is not supported.
    #[error("Unknown Kubernetes controller type '{0}'")]
    UnknownControllerType(String),

    /// The host's application identity cannot be read.
    #[error("Invalid application identity for {role}: {reason}")]
    InvalidApplicationIdentity {
        /// Host role
        role: String,
        /// Why it is invalid
        reason: String,
    },

    /// A namespace label selector is malformed.
    #[error("Invalid namespace label selector '{0}'")]
    InvalidLabelSelector(String),

    /// The pod's namespace labels do not satisfy the selector.
    #[error("Namespace '{namespace}' labels do not match selector '{selector}'")]
    LabelSelectorMismatch {
        /// Pod namespace
        namespace: String,
        /// Configured selector
        selector: String,
    },

    /// The Kubernetes API could not serve a lookup.
    #[error("Kubernetes API unavailable: {0}")]
    K8sApiUnavailable(String),

    // ── Required configuration ───────────────────────────────────────────
    /// A required variable resource does not exist.
    #[error("Required resource '{0}' is missing")]
    RequiredResourceMissing(String),

    /// A required variable exists but has no value.
    #[error("Required secret '{0}' has no value")]
    RequiredSecretMissing(String),

    /// A required request parameter is missing.
    #[error("Missing required request parameter '{0}'")]
    MissingRequestParam(String),

    // ── Configuration validity ───────────────────────────────────────────
    /// Both or neither of `provider-uri` and `jwks-uri` are configured.
    #[error("Exactly one of '{provider_uri}' and '{jwks_uri}' must be configured for {webservice}")]
    InvalidUriConfiguration {
        /// Webservice name
        webservice: String,
        /// Provider URI variable name
        provider_uri: &'static str,
        /// JWKS URI variable name
        jwks_uri: &'static str,
    },

    /// A configured URI cannot be parsed.
    #[error("Invalid URI in '{variable}': {cause}")]
    InvalidUri {
        /// Variable name
        variable: String,
        /// Parse error
        cause: String,
    },

    /// Both or neither identity sources are configured.
    #[error("Identity misconfigured for {0}: exactly one of token-app-property and URL identity is required")]
    IdentityMisconfigured(String),

    /// `token-app-property` is not a valid claim path.
    #[error("Invalid token-app-property value '{0}'")]
    InvalidTokenAppPropertyValue(String),

    /// `identity-path` is malformed.
    #[error("Invalid identity-path value '{0}'")]
    InvalidIdentityPath(String),

    /// `enforced-claims` is malformed.
    #[error("Invalid enforced-claims value '{0}'")]
    InvalidEnforcedClaimsFormat(String),

    /// `claim-aliases` contains an empty entry.
    #[error("Claim aliases value '{0}' contains an empty entry")]
    MappedClaimsBlankOrEmpty(String),

    /// A `claim-aliases` tuple is not `alias:claim`.
    #[error("Invalid claim alias entry '{0}': expected 'alias:claim'")]
    InvalidClaimAliasFormat(String),

    /// An alias name appears twice.
    #[error("Claim alias '{0}' is defined more than once")]
    DuplicateClaimAlias(String),

    /// A claim name that does not match the claim grammar.
    #[error("Invalid claim name '{0}'")]
    InvalidClaimName(String),

    /// A deny-listed standard claim used in enforced claims or aliases.
    #[error("Claim '{0}' is not allowed in this configuration")]
    ClaimInDenyList(String),

    // ── Upstream ─────────────────────────────────────────────────────────
    /// OIDC discovery timed out.
    #[error("OIDC discovery against '{provider_uri}' timed out: {cause}")]
    ProviderDiscoveryTimeout {
        /// Provider URI
        provider_uri: String,
        /// Underlying cause
        cause: String,
    },

    /// OIDC discovery failed.
    #[error("OIDC discovery against '{provider_uri}' failed: {cause}")]
    ProviderDiscoveryFailed {
        /// Provider URI
        provider_uri: String,
        /// Underlying cause
        cause: String,
    },

    /// Keys could not be fetched after successful discovery.
    #[error("Failed to fetch keys from provider '{provider_uri}': {cause}")]
    FetchProviderKeysFailed {
        /// Provider URI
        provider_uri: String,
        /// Underlying cause
        cause: String,
    },

    /// Direct JWKS fetch failed.
    #[error("Failed to fetch JWKS from '{jwks_uri}': {cause}")]
    FetchJwksKeysFailed {
        /// JWKS URI
        jwks_uri: String,
        /// Underlying cause
        cause: String,
    },

    /// Too many signing-key refreshes in flight.
    #[error("Signing key refresh concurrency limit reached, retry later")]
    KeyRefreshConcurrencyLimit,

    /// The per-webservice refresh budget is spent.
    #[error("Signing key refresh rate limit reached for {0}, retry later")]
    KeyRefreshRateLimited(String),

    /// The whole authentication call exceeded its deadline.
    #[error("Authentication timed out after {0:?}")]
    RequestTimeout(Duration),

    // ── Policy store ─────────────────────────────────────────────────────
    /// Another load of the same policy is in progress.
    #[error("Concurrent policy load in progress, retry after {retry_after}s")]
    ConcurrentLoad {
        /// Suggested retry delay in seconds.
        retry_after: u64,
    },

    // ── Internal ─────────────────────────────────────────────────────────
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transport intent of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountNotDefined(_)
            | Self::ServiceNotDefined(_)
            | Self::NotWhitelisted(_)
            | Self::UserNotDefined(_)
            | Self::AuthenticatorNotFound(_)
            | Self::RoleNotFound(_)
            | Self::ServiceIdMissing(_)
            | Self::InvalidIdentifier(_)
            | Self::InvalidCredentials
            | Self::MalformedToken(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::InvalidSignature
            | Self::UnknownKeyId(_)
            | Self::TokenExpired
            | Self::TokenNotYetValid
            | Self::TokenIssuedInFuture
            | Self::MissingMandatoryClaim(_)
            | Self::InvalidIssuer { .. }
            | Self::InvalidAudience(_)
            | Self::NoSuchFieldInToken(_)
            | Self::EmptyAnnotationGiven(_)
            | Self::JwtTokenClaimIsMissing(_)
            | Self::InvalidResourceRestrictions(_)
            | Self::RoleMissingConstraint(_)
            | Self::RoleMissingRequiredConstraints(_)
            | Self::ConstraintNotSupported { .. }
            | Self::RestrictionOnDeniedClaim(_)
            | Self::OidcCodeRejected(_)
            | Self::OidcSubjectMismatch { .. }
            | Self::OidcProfileScopeMissing
            | Self::InvalidPodIdentity(_)
            | Self::PodNotFound { .. }
            | Self::K8sObjectNotFound { .. }
            | Self::PodRelationMismatch(_)
            | Self::NamespaceMismatch { .. }
            | Self::UnknownControllerType(_)
            | Self::InvalidApplicationIdentity { .. }
            | Self::LabelSelectorMismatch { .. }
            | Self::RequiredResourceMissing(_)
            | Self::RequiredSecretMissing(_) => ErrorKind::Unauthenticated,

            Self::UserNotAuthorized { .. } => ErrorKind::Forbidden,

            Self::MissingRequestParam(_) => ErrorKind::BadRequest,

            Self::InvalidUriConfiguration { .. }
            | Self::InvalidUri { .. }
            | Self::IdentityMisconfigured(_)
            | Self::InvalidTokenAppPropertyValue(_)
            | Self::InvalidIdentityPath(_)
            | Self::InvalidEnforcedClaimsFormat(_)
            | Self::MappedClaimsBlankOrEmpty(_)
            | Self::InvalidClaimAliasFormat(_)
            | Self::DuplicateClaimAlias(_)
            | Self::InvalidClaimName(_)
            | Self::ClaimInDenyList(_)
            | Self::InvalidLabelSelector(_) => ErrorKind::ConfigurationInvalid,

            Self::ProviderDiscoveryTimeout { .. } | Self::RequestTimeout(_) => {
                ErrorKind::UpstreamTimeout
            }

            Self::ProviderDiscoveryFailed { .. }
            | Self::FetchProviderKeysFailed { .. }
            | Self::FetchJwksKeysFailed { .. }
            | Self::DirectoryUnavailable(_)
            | Self::OidcEndpointFailed { .. }
            | Self::K8sApiUnavailable(_) => ErrorKind::BadGateway,

            Self::KeyRefreshConcurrencyLimit | Self::KeyRefreshRateLimited(_) => {
                ErrorKind::ServiceUnavailable
            }

            Self::ConcurrentLoad { .. } => ErrorKind::Conflict,

            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyRefreshConcurrencyLimit
                | Self::KeyRefreshRateLimited(_)
                | Self::ConcurrentLoad { .. }
        )
    }

    /// Signature-level failures that a signing-key refresh may cure.
    #[must_use]
    pub fn is_key_mismatch(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::UnknownKeyId(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_failures_are_unauthenticated() {
        assert_eq!(Error::AccountNotDefined("acme".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::NotWhitelisted("authn-jwt/x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::RequiredSecretMissing("acme:variable:x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn missing_privilege_is_forbidden() {
        let err = Error::UserNotAuthorized {
            role: "acme:host:ci".into(),
            privilege: "authenticate".into(),
            resource: "acme:webservice:conjur/authn-jwt/x".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn mutually_exclusive_config_is_unprocessable() {
        let err = Error::InvalidUriConfiguration {
            webservice: "authn-jwt/x".into(),
            provider_uri: "provider-uri",
            jwks_uri: "jwks-uri",
        };
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            Error::IdentityMisconfigured("authn-jwt/x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn upstream_failures_map_to_gateway_statuses() {
        let timeout = Error::ProviderDiscoveryTimeout {
            provider_uri: "https://idp".into(),
            cause: "timed out".into(),
        };
        let failed = Error::FetchJwksKeysFailed {
            jwks_uri: "https://idp/keys".into(),
            cause: "500".into(),
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            Error::KeyRefreshConcurrencyLimit.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn pod_and_code_flow_failures_are_unauthenticated() {
        let missing = Error::PodNotFound {
            name: "app-1".into(),
            namespace: "prod".into(),
        };
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.to_string(), "No Pod found for podname app-1 in namespace prod");
        assert_eq!(Error::OidcProfileScopeMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::InvalidLabelSelector("key,".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(Error::K8sApiUnavailable("refused".into()).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::KeyRefreshConcurrencyLimit.is_retryable());
        assert!(Error::ConcurrentLoad { retry_after: 3 }.is_retryable());
        assert!(!Error::InvalidSignature.is_retryable());
    }

    #[test]
    fn missing_param_is_bad_request() {
        assert_eq!(
            Error::MissingRequestParam("id_token".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn claim_missing_message_names_the_claim() {
        let err = Error::JwtTokenClaimIsMissing("'sub (annotation: machine)'".into());
        assert_eq!(err.to_string(), "Claim 'sub (annotation: machine)' is missing from JWT token");
    }
}
