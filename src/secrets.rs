//! Per-webservice configuration variables.
//!
//! Authenticators are configured through variables under
//! `conjur/<type>/<service_id>/`. Three access patterns are used:
//!
//! - [`WebserviceSecrets::required`]: the variable must exist and hold a value.
//! - [`WebserviceSecrets::optional`]: an absent variable means the feature is
//!   unused (`Ok(None)`); a declared variable without a value is an error.
//! - [`WebserviceSecrets::present`]: any non-blank value, without erroring. Used
//!   for mutually exclusive options where both-or-neither is decided by the caller.

use authn_types::Webservice;
use tracing::debug;

use crate::policy::{PolicyStore, SecretLookup};
use crate::{Error, Result};

/// Variable reader bound to one webservice.
pub struct WebserviceSecrets<'a> {
    store: &'a dyn PolicyStore,
    webservice: &'a Webservice,
}

impl<'a> WebserviceSecrets<'a> {
    /// Bind to a webservice.
    pub fn new(store: &'a dyn PolicyStore, webservice: &'a Webservice) -> Self {
        Self { store, webservice }
    }

    /// Webservice the variables belong to.
    pub fn webservice(&self) -> &Webservice {
        self.webservice
    }

    /// A variable that must exist and hold a value.
    pub async fn required(&self, name: &str) -> Result<String> {
        let id = self.webservice.variable_id(name);
        match self.store.secret(&id).await? {
            SecretLookup::Value(value) => Ok(value),
            SecretLookup::NoValue => Err(Error::RequiredSecretMissing(id.to_string())),
            SecretLookup::ResourceMissing => Err(Error::RequiredResourceMissing(id.to_string())),
        }
    }

    /// A variable whose absence disables a feature.
    pub async fn optional(&self, name: &str) -> Result<Option<String>> {
        let id = self.webservice.variable_id(name);
        match self.store.secret(&id).await? {
            SecretLookup::Value(value) => Ok(Some(value)),
            SecretLookup::NoValue => Err(Error::RequiredSecretMissing(id.to_string())),
            SecretLookup::ResourceMissing => {
                debug!(variable = %id, "Optional variable not configured");
                Ok(None)
            }
        }
    }

    /// A non-blank value, or `None` for a missing, empty or blank variable.
    pub async fn present(&self, name: &str) -> Result<Option<String>> {
        let id = self.webservice.variable_id(name);
        Ok(match self.store.secret(&id).await? {
            SecretLookup::Value(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
    }

    /// Whether the variable resource is declared, regardless of its value.
    pub async fn is_declared(&self, name: &str) -> Result<bool> {
        let id = self.webservice.variable_id(name);
        Ok(!matches!(
            self.store.secret(&id).await?,
            SecretLookup::ResourceMissing
        ))
    }
}
