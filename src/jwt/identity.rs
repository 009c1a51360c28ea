//! Identity resolution for JWT authentication.
//!
//! The caller's role comes from exactly one place:
//!
//! - the URL (`/authn-jwt/<service>/<account>/<username>/authenticate`), or
//! - a token claim named by `token-app-property`, optionally prefixed with
//!   `identity-path`, yielding `host/<path>/<claim-value>`.
//!
//! Both or neither configured is [`Error::IdentityMisconfigured`].

use authn_types::HOST_PREFIX;
use tracing::debug;

use super::claims::{ClaimPath, DecodedToken, PATH_DELIMITER};
use super::{IDENTITY_PATH_VARIABLE, TOKEN_APP_PROPERTY_VARIABLE};
use crate::secrets::WebserviceSecrets;
use crate::{Error, Result};

/// Where the identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityConfig {
    /// A token claim, with an optional namespace prefix.
    TokenField {
        /// Claim holding the identity
        claim: ClaimPath,
        /// Slash-delimited prefix, empty for none
        identity_path: String,
    },
    /// The username given in the request URL.
    Url {
        /// Username as claimed
        username: String,
    },
}

/// Token-field identity settings as configured, before any request is seen.
///
/// `None` from [`TokenFieldSettings::read`] means the feature is unused; an
/// error means it is configured but broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFieldSettings {
    /// Claim holding the identity
    pub claim: ClaimPath,
    /// Normalized identity path
    pub identity_path: String,
}

impl TokenFieldSettings {
    /// Read `token-app-property` and `identity-path`.
    ///
    /// # Errors
    ///
    /// [`Error::RequiredSecretMissing`] when `token-app-property` is declared
    /// without a value, [`Error::InvalidTokenAppPropertyValue`] when it is not a
    /// claim path and [`Error::InvalidIdentityPath`] for a malformed path.
    pub async fn read(secrets: &WebserviceSecrets<'_>) -> Result<Option<Self>> {
        let Some(property) = secrets.optional(TOKEN_APP_PROPERTY_VARIABLE).await? else {
            return Ok(None);
        };
        let claim = ClaimPath::parse(&property)
            .map_err(|_| Error::InvalidTokenAppPropertyValue(property.clone()))?;

        let identity_path = match secrets.optional(IDENTITY_PATH_VARIABLE).await? {
            Some(path) => normalize_identity_path(&path)?,
            None => String::new(),
        };
        Ok(Some(Self { claim, identity_path }))
    }
}

impl IdentityConfig {
    /// Pick the identity source from configuration and the request.
    ///
    /// # Errors
    ///
    /// [`Error::IdentityMisconfigured`] when both or neither are available.
    pub fn select(
        webservice: &str,
        token_field: Option<TokenFieldSettings>,
        url_username: Option<&str>,
    ) -> Result<Self> {
        match (token_field, url_username) {
            (Some(settings), None) => {
                debug!(webservice, claim = %settings.claim, "Selected token identity provider");
                Ok(Self::TokenField {
                    claim: settings.claim,
                    identity_path: settings.identity_path,
                })
            }
            (None, Some(username)) => {
                debug!(webservice, "Selected URL identity provider");
                Ok(Self::Url {
                    username: username.to_string(),
                })
            }
            _ => Err(Error::IdentityMisconfigured(webservice.to_string())),
        }
    }

    /// The provider for this configuration.
    pub fn provider(&self) -> Box<dyn IdentityProvider + '_> {
        match self {
            Self::TokenField { claim, identity_path } => Box::new(TokenFieldIdentity {
                claim,
                identity_path,
            }),
            Self::Url { username } => Box::new(UrlIdentity { username }),
        }
    }
}

/// Produces the username to authenticate as.
pub trait IdentityProvider: Send + Sync {
    /// Username for a verified token.
    fn identity(&self, token: &DecodedToken) -> Result<String>;

    /// Whether the identity comes from the token rather than the URL.
    fn from_token(&self) -> bool;
}

/// Identity from a token claim.
#[derive(Debug)]
pub struct TokenFieldIdentity<'a> {
    claim: &'a ClaimPath,
    identity_path: &'a str,
}

impl IdentityProvider for TokenFieldIdentity<'_> {
    fn identity(&self, token: &DecodedToken) -> Result<String> {
        let value = token
            .lookup_string(self.claim.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::NoSuchFieldInToken(self.claim.to_string()))?;

        let identity = if self.identity_path.is_empty() {
            format!("{HOST_PREFIX}{value}")
        } else {
            format!("{HOST_PREFIX}{}{PATH_DELIMITER}{value}", self.identity_path)
        };
        debug!(claim = %self.claim, identity = %identity, "Resolved identity from token");
        Ok(identity)
    }

    fn from_token(&self) -> bool {
        true
    }
}

/// Identity from the request URL.
#[derive(Debug)]
pub struct UrlIdentity<'a> {
    username: &'a str,
}

impl IdentityProvider for UrlIdentity<'_> {
    fn identity(&self, _token: &DecodedToken) -> Result<String> {
        Ok(self.username.to_string())
    }

    fn from_token(&self) -> bool {
        false
    }
}

/// Trim surrounding slashes and reject empty or whitespace-bearing segments.
fn normalize_identity_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_matches(PATH_DELIMITER);
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let valid = trimmed
        .split(PATH_DELIMITER)
        .all(|segment| !segment.is_empty() && !segment.chars().any(char::is_whitespace));
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(Error::InvalidIdentityPath(raw.to_string()))
    }
}
