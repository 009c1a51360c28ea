//! Security validation run before any strategy-specific verification.
//!
//! Checks, in order, each with its own error:
//!
//! 1. the account has an admin role ([`Error::AccountNotDefined`])
//! 2. a resource backs the webservice ([`Error::ServiceNotDefined`])
//! 3. the allow-list admits the webservice ([`Error::NotWhitelisted`])
//! 4. the claimed role exists ([`Error::UserNotDefined`])
//! 5. the role may `authenticate` on the webservice ([`Error::UserNotAuthorized`])
//!
//! The default authenticator only runs step 3. Steps 4 and 5 run up front when
//! the request names a username; token-derived identities go through
//! [`SecurityValidator::validate_role`] once the strategy has resolved them.

use std::collections::BTreeSet;
use std::sync::Arc;

use authn_types::{ResourceId, Webservice};
use tracing::debug;

use crate::policy::{AUTHENTICATE_PRIVILEGE, PolicyStore};
use crate::{Error, Result};

/// Ordered security checks over the policy store.
pub struct SecurityValidator {
    store: Arc<dyn PolicyStore>,
    enabled: BTreeSet<String>,
}

impl SecurityValidator {
    /// Create over a store and the allow-listed webservice names.
    pub fn new(store: Arc<dyn PolicyStore>, enabled: BTreeSet<String>) -> Self {
        Self { store, enabled }
    }

    /// Steps 1-3, then 4-5 when a role is claimed.
    pub async fn validate(&self, webservice: &Webservice, claimed: Option<&ResourceId>) -> Result<()> {
        self.validate_webservice(webservice).await?;
        if let Some(role) = claimed {
            self.validate_role(webservice, role).await?;
        }
        Ok(())
    }

    /// Steps 1-3.
    pub async fn validate_webservice(&self, webservice: &Webservice) -> Result<()> {
        if !webservice.is_default() {
            let admin = ResourceId::admin(webservice.account());
            if !self.store.role_exists(&admin).await? {
                return Err(Error::AccountNotDefined(webservice.account().to_string()));
            }
            if !self.store.resource_exists(&webservice.resource_id()).await? {
                return Err(Error::ServiceNotDefined(webservice.name()));
            }
        }

        if !self.enabled.contains(&webservice.name()) {
            return Err(Error::NotWhitelisted(webservice.name()));
        }
        debug!(webservice = %webservice, "Webservice validated");
        Ok(())
    }

    /// Steps 4-5. A no-op for the default authenticator.
    pub async fn validate_role(&self, webservice: &Webservice, role: &ResourceId) -> Result<()> {
        if webservice.is_default() {
            return Ok(());
        }
        self.require_privilege(role, AUTHENTICATE_PRIVILEGE, &webservice.resource_id())
            .await
    }

    /// Role existence, then `privilege` on `resource`.
    pub async fn require_privilege(
        &self,
        role: &ResourceId,
        privilege: &str,
        resource: &ResourceId,
    ) -> Result<()> {
        if !self.store.role_exists(role).await? {
            return Err(Error::UserNotDefined(role.to_string()));
        }
        if !self.store.allowed_to(role, privilege, resource).await? {
            debug!(role = %role, privilege, resource = %resource, "Privilege missing");
            return Err(Error::UserNotAuthorized {
                role: role.to_string(),
                privilege: privilege.to_string(),
                resource: resource.to_string(),
            });
        }
        Ok(())
    }
}
