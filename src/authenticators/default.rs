//! Default `authn` authenticator: API key authentication and password login.

use std::sync::Arc;

use authn_types::{DEFAULT_AUTHENTICATOR, ResourceId};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{Authenticator, RoleIdentity};
use crate::input::AuthenticatorInput;
use crate::policy::CredentialStore;
use crate::{Error, Result};

/// Checks API keys and exchanges passwords for API keys.
pub struct DefaultAuthenticator {
    credentials: Arc<dyn CredentialStore>,
}

impl DefaultAuthenticator {
    /// Create over a credential store.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Exchange a password (or the API key itself) for the role's API key.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCredentials`] for a blank or wrong secret, or a role
    /// without an API key.
    pub async fn login(&self, role: &ResourceId, password: &str) -> Result<String> {
        if password.trim().is_empty() {
            return Err(Error::InvalidCredentials);
        }
        let api_key = self
            .credentials
            .api_key(role)
            .await?
            .ok_or(Error::InvalidCredentials)?;

        let accepted = self.credentials.password_matches(role, password).await?
            || bool::from(api_key.as_bytes().ct_eq(password.as_bytes()));
        if !accepted {
            return Err(Error::InvalidCredentials);
        }
        debug!(role = %role, "Login accepted");
        Ok(api_key)
    }
}

#[async_trait::async_trait]
impl Authenticator for DefaultAuthenticator {
    fn name(&self) -> &'static str {
        DEFAULT_AUTHENTICATOR
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity> {
        let role = input
            .claimed_role()
            .ok_or_else(|| Error::MissingRequestParam("username".to_string()))?;
        let presented = input.credential().as_str()?;
        if presented.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        let stored = self
            .credentials
            .api_key(&role)
            .await?
            .ok_or(Error::InvalidCredentials)?;
        if !bool::from(stored.as_bytes().ct_eq(presented.as_bytes())) {
            return Err(Error::InvalidCredentials);
        }
        Ok(RoleIdentity::new(role))
    }
}
