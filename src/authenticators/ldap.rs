//! `authn-ldap`: username and password checked by a directory bind.

use std::sync::Arc;

use authn_types::{ResourceId, Webservice};
use tracing::debug;

use super::{Authenticator, RoleIdentity};
use crate::input::AuthenticatorInput;
use crate::{Error, Result};

/// Authenticator type name.
pub const AUTHENTICATOR_NAME: &str = "authn-ldap";

/// Login that may never authenticate through a directory.
const RESERVED_LOGIN: &str = "admin";

/// Directory client.
#[async_trait::async_trait]
pub trait DirectoryBinder: Send + Sync {
    /// Attempt a simple bind. `Ok(false)` is a rejected bind; transport and
    /// server failures are [`Error::DirectoryUnavailable`].
    async fn bind(&self, webservice: &Webservice, username: &str, password: &str) -> Result<bool>;
}

/// The `authn-ldap` authenticator.
pub struct LdapAuthenticator {
    directory: Arc<dyn DirectoryBinder>,
}

impl LdapAuthenticator {
    /// Create over a directory client.
    pub fn new(directory: Arc<dyn DirectoryBinder>) -> Self {
        Self { directory }
    }
}

#[async_trait::async_trait]
impl Authenticator for LdapAuthenticator {
    fn name(&self) -> &'static str {
        AUTHENTICATOR_NAME
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity> {
        let webservice = input.webservice()?;
        let username = input
            .username()
            .ok_or_else(|| Error::MissingRequestParam("username".to_string()))?;
        let password = input.credential().as_str()?;

        // An empty password is an anonymous bind, which most directories accept.
        if password.is_empty() || username == RESERVED_LOGIN {
            return Err(Error::InvalidCredentials);
        }

        if !self.directory.bind(&webservice, username, password).await? {
            debug!(webservice = %webservice, "Directory bind rejected");
            return Err(Error::InvalidCredentials);
        }
        Ok(RoleIdentity::new(ResourceId::from_username(webservice.account(), username)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Credential;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDirectory {
        binds: AtomicUsize,
        reachable: bool,
    }

    #[async_trait::async_trait]
    impl DirectoryBinder for FakeDirectory {
        async fn bind(&self, _ws: &Webservice, username: &str, password: &str) -> Result<bool> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            if !self.reachable {
                return Err(Error::DirectoryUnavailable("ldap://dir: connection refused".into()));
            }
            Ok(username == "alice" && password == "s3cret")
        }
    }

    fn authenticator(reachable: bool) -> (Arc<FakeDirectory>, LdapAuthenticator) {
        let dir = Arc::new(FakeDirectory {
            binds: AtomicUsize::new(0),
            reachable,
        });
        (Arc::clone(&dir), LdapAuthenticator::new(dir))
    }

    fn input(username: &str, password: &str) -> AuthenticatorInput {
        AuthenticatorInput::new(
            "authn-ldap",
            Some("corp".into()),
            "acme",
            Some(username.into()),
            Credential::new(password.to_string()),
        )
    }

    #[tokio::test]
    async fn successful_bind_resolves_user() {
        let (_, authn) = authenticator(true);
        let identity = authn.verify(&input("alice", "s3cret")).await.unwrap();
        assert_eq!(identity.role_id.to_string(), "acme:user:alice");
    }

    #[tokio::test]
    async fn empty_password_and_admin_never_reach_directory() {
        // GIVEN
        let (dir, authn) = authenticator(true);

        // WHEN
        let empty = authn.verify(&input("alice", "")).await;
        let admin = authn.verify(&input("admin", "anything")).await;

        // THEN
        assert!(matches!(empty, Err(Error::InvalidCredentials)));
        assert!(matches!(admin, Err(Error::InvalidCredentials)));
        assert_eq!(dir.binds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_directory_is_bad_gateway() {
        let (_, authn) = authenticator(false);
        let err = authn.verify(&input("alice", "s3cret")).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
