//! Authenticator registry
//!
//! Holds the installed strategy implementations keyed by type name and the
//! operator allow-list. Built once at startup; read-only afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use authn_types::{DEFAULT_AUTHENTICATOR, Webservice};
use serde::Serialize;

use crate::authenticators::Authenticator;
use crate::policy::PolicyStore;
use crate::{Error, Result};

/// The three views reported by `list_authenticators`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthenticatorList {
    /// Types compiled in.
    pub installed: BTreeSet<String>,
    /// Webservices defined in policy.
    pub configured: BTreeSet<String>,
    /// Webservices on the operator allow-list.
    pub enabled: BTreeSet<String>,
}

/// Installed authenticators and the allow-list.
pub struct AuthenticatorRegistry {
    strategies: BTreeMap<&'static str, Arc<dyn Authenticator>>,
    enabled: BTreeSet<String>,
}

impl AuthenticatorRegistry {
    /// Create with an allow-list of webservice names.
    pub fn new(enabled: &[Webservice]) -> Self {
        Self {
            strategies: BTreeMap::new(),
            enabled: enabled.iter().map(Webservice::name).collect(),
        }
    }

    /// Install an implementation under its type name, replacing any previous one.
    #[must_use]
    pub fn with(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.strategies.insert(authenticator.name(), authenticator);
        self
    }

    /// Implementation for a type name.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticatorNotFound`] when no implementation is installed.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Authenticator>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AuthenticatorNotFound(name.to_string()))
    }

    /// Installed type names.
    pub fn installed(&self) -> BTreeSet<String> {
        self.strategies.keys().map(|name| (*name).to_string()).collect()
    }

    /// Allow-listed webservice names.
    pub fn enabled(&self) -> &BTreeSet<String> {
        &self.enabled
    }

    /// Whether the allow-list admits `webservice`.
    pub fn is_enabled(&self, webservice: &Webservice) -> bool {
        self.enabled.contains(&webservice.name())
    }

    /// Webservices defined in policy for `account` whose type is installed.
    /// The default authenticator needs no policy and is always configured.
    pub async fn configured(&self, store: &dyn PolicyStore, account: &str) -> Result<BTreeSet<String>> {
        let mut configured: BTreeSet<String> = store
            .webservices(account)
            .await?
            .into_iter()
            .filter(|ws| self.strategies.contains_key(ws.authenticator()))
            .map(|ws| ws.name())
            .collect();
        configured.insert(DEFAULT_AUTHENTICATOR.to_string());
        Ok(configured)
    }

    /// All three views for `account`.
    pub async fn list(&self, store: &dyn PolicyStore, account: &str) -> Result<AuthenticatorList> {
        Ok(AuthenticatorList {
            installed: self.installed(),
            configured: self.configured(store, account).await?,
            enabled: self.enabled.clone(),
        })
    }
}
