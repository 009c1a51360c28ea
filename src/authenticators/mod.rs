//! Authenticator strategies.
//!
//! Every authenticator type implements [`Authenticator`]: one `verify` call that
//! turns an [`AuthenticatorInput`] into a [`RoleIdentity`] or a typed error, and
//! a configuration-only `status` check. Implementations receive their
//! collaborators through their constructors and keep no per-request state.

pub mod default;
pub mod gcp;
pub mod k8s;
pub mod ldap;
pub mod oidc;

use authn_types::{ResourceId, Webservice};
use serde::Serialize;

use crate::Result;
use crate::input::AuthenticatorInput;

pub use default::DefaultAuthenticator;
pub use gcp::GcpAuthenticator;
pub use k8s::{K8sAuthenticator, K8sObjectLookup};
pub use ldap::{DirectoryBinder, LdapAuthenticator};
pub use oidc::{HttpOidcClient, OidcAuthenticator, OidcCodeClient};

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleIdentity {
    /// Role the caller authenticated as.
    pub role_id: ResourceId,
}

impl RoleIdentity {
    /// Wrap a role id.
    #[must_use]
    pub fn new(role_id: ResourceId) -> Self {
        Self { role_id }
    }

    /// Account of the role.
    pub fn account(&self) -> &str {
        self.role_id.account()
    }
}

/// One authenticator type.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Type name, e.g. `authn-jwt`.
    fn name(&self) -> &'static str;

    /// Verify the credential in `input`.
    ///
    /// The security pipeline has already run for the claimed username, if any.
    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity>;

    /// Configuration-only health check for `webservice`. Never verifies a
    /// credential and never contacts an identity provider.
    async fn status(&self, _webservice: &Webservice) -> Result<()> {
        Ok(())
    }
}
