//! Normalized authentication request.
//!
//! [`AuthenticatorInput`] is built once at the boundary and never mutated. The
//! credential is held in a [`Credential`] whose `Debug` output is redacted so the
//! input can be logged without leaking secret material.

use std::fmt;
use std::net::IpAddr;

use authn_types::{ResourceId, Webservice};
use axum::http::HeaderMap;
use bytes::Bytes;

use crate::{Error, Result};

/// Opaque credential payload (API key, password, JWT, form body).
#[derive(Clone, Default)]
pub struct Credential(Bytes);

impl Credential {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the payload is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.iter().all(u8::is_ascii_whitespace)
    }

    /// Payload as UTF-8, trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedToken`] when the payload is not UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map(str::trim)
            .map_err(|_| Error::MalformedToken("credential is not valid UTF-8".to_string()))
    }

    /// Value of one field of a form-encoded payload (`jwt=...`, `id_token=...`).
    pub fn form_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.0)
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.trim().is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([REDACTED; {} bytes])", self.0.len())
    }
}

/// Build the webservice a request names, mapping parse errors into [`Error`].
pub(crate) fn webservice(
    account: &str,
    authenticator_name: &str,
    service_id: Option<String>,
) -> Result<Webservice> {
    Webservice::new(account, authenticator_name, service_id)
        .map_err(|e| match e {
            authn_types::ParseError::ServiceIdMissing(name) => Error::ServiceIdMissing(name),
            other => Error::InvalidIdentifier(other),
        })
}

/// One verification request.
#[derive(Debug, Clone)]
pub struct AuthenticatorInput {
    authenticator_name: String,
    service_id: Option<String>,
    account: String,
    username: Option<String>,
    credential: Credential,
    origin: Option<IpAddr>,
    headers: HeaderMap,
}

impl AuthenticatorInput {
    /// Build an input. Blank service ids and usernames count as absent.
    pub fn new(
        authenticator_name: impl Into<String>,
        service_id: Option<String>,
        account: impl Into<String>,
        username: Option<String>,
        credential: Credential,
    ) -> Self {
        Self {
            authenticator_name: authenticator_name.into(),
            service_id: service_id.filter(|s| !s.trim().is_empty()),
            account: account.into(),
            username: username.filter(|s| !s.trim().is_empty()),
            credential,
            origin: None,
            headers: HeaderMap::new(),
        }
    }

    /// Attach the client origin.
    #[must_use]
    pub fn with_origin(mut self, origin: Option<IpAddr>) -> Self {
        self.origin = origin;
        self
    }

    /// Attach the raw request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Authenticator type, e.g. `authn-jwt`.
    pub fn authenticator_name(&self) -> &str {
        &self.authenticator_name
    }

    /// Service id, if any.
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// Account.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Username claimed in the request URL, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Credential payload.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Client origin.
    pub fn origin(&self) -> Option<IpAddr> {
        self.origin
    }

    /// Raw request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Webservice this request targets.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceIdMissing`] when a non-default authenticator has no service id.
    pub fn webservice(&self) -> Result<Webservice> {
        webservice(&self.account, &self.authenticator_name, self.service_id.clone())
    }

    /// Role id for the claimed username, if any.
    pub fn claimed_role(&self) -> Option<ResourceId> {
        self.username
            .as_deref()
            .map(|u| ResourceId::from_username(&self.account, u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_credential() {
        // GIVEN: an input carrying a secret
        let input = AuthenticatorInput::new(
            "authn",
            None,
            "acme",
            Some("alice".into()),
            Credential::new("s3cr3t-api-key"),
        );

        // WHEN: formatted for logs
        let rendered = format!("{input:?}");

        // THEN: the secret does not appear
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn form_param_extracts_named_field() {
        let cred = Credential::new("jwt=eyJhbGc.x.y&other=1");
        assert_eq!(cred.form_param("jwt").as_deref(), Some("eyJhbGc.x.y"));
        assert_eq!(cred.form_param("id_token"), None);
    }

    #[test]
    fn blank_form_param_counts_as_absent() {
        let cred = Credential::new("id_token=%20");
        assert_eq!(cred.form_param("id_token"), None);
    }

    #[test]
    fn webservice_requires_service_id_for_jwt() {
        let input = AuthenticatorInput::new("authn-jwt", None, "acme", None, Credential::default());
        assert!(matches!(input.webservice(), Err(Error::ServiceIdMissing(_))));
    }

    #[test]
    fn blank_username_counts_as_absent() {
        let input = AuthenticatorInput::new(
            "authn-jwt",
            Some("svc".into()),
            "acme",
            Some(" ".into()),
            Credential::default(),
        );
        assert_eq!(input.username(), None);
        assert_eq!(input.claimed_role(), None);
    }

    #[test]
    fn claimed_role_maps_host_prefix() {
        let input = AuthenticatorInput::new(
            "authn-jwt",
            Some("svc".into()),
            "acme",
            Some("host/apps/ci".into()),
            Credential::default(),
        );
        assert_eq!(input.claimed_role().unwrap().to_string(), "acme:host:apps/ci");
    }
}
