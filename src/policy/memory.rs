//! In-memory policy store, seeded from YAML.
//!
//! ```yaml
//! roles:
//!   - id: acme:user:admin
//!     api_key: admin-key
//!   - id: acme:host:jwt-apps/ci
//!     annotations:
//!       authn-jwt/gitlab/project_path: group/project
//! resources:
//!   - id: acme:webservice:conjur/authn-jwt/gitlab
//!     permits:
//!       - role: acme:host:jwt-apps/ci
//!         privilege: authenticate
//! secrets:
//!   acme:variable:conjur/authn-jwt/gitlab/jwks-uri: https://gitlab.example.com/-/jwks
//!   acme:variable:conjur/authn-jwt/gitlab/token-app-property: ~
//! ```
//!
//! A `~` secret declares the variable without a value.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use authn_types::{ResourceId, Webservice};
use parking_lot::RwLock;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{
    CredentialStore, PolicyStore, SecretLookup, concurrent_load, webservice_from_resource,
};
use crate::{Error, Result};

/// YAML seed document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PolicySeed {
    /// Roles (users and hosts). Each role is also a resource.
    pub roles: Vec<RoleSeed>,
    /// Non-role resources (webservices, variables).
    pub resources: Vec<ResourceSeed>,
    /// Variable values keyed by variable id.
    pub secrets: BTreeMap<ResourceId, Option<String>>,
}

/// One seeded role.
#[derive(Debug, Deserialize)]
pub struct RoleSeed {
    /// Role id
    pub id: ResourceId,
    /// Annotations on the role's resource
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// API key
    #[serde(default)]
    pub api_key: Option<String>,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
}

/// One seeded resource.
#[derive(Debug, Deserialize)]
pub struct ResourceSeed {
    /// Resource id
    pub id: ResourceId,
    /// Annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Privileges granted on this resource
    #[serde(default)]
    pub permits: Vec<PermitSeed>,
}

/// One privilege grant.
#[derive(Debug, Deserialize)]
pub struct PermitSeed {
    /// Grantee
    pub role: ResourceId,
    /// Privilege name
    pub privilege: String,
}

#[derive(Default)]
struct State {
    roles: HashSet<ResourceId>,
    resources: HashMap<ResourceId, BTreeMap<String, String>>,
    permissions: HashSet<(ResourceId, String, ResourceId)>,
    secrets: HashMap<ResourceId, Option<String>>,
    api_keys: HashMap<ResourceId, String>,
    passwords: HashMap<ResourceId, String>,
}

/// In-memory [`PolicyStore`] and [`CredentialStore`].
#[derive(Default)]
pub struct InMemoryPolicyStore {
    state: RwLock<State>,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a parsed seed.
    #[must_use]
    pub fn from_seed(seed: PolicySeed) -> Self {
        let store = Self::new();
        for role in seed.roles {
            store.add_role(role.id.clone(), role.annotations);
            if let Some(key) = role.api_key {
                store.set_api_key(&role.id, key);
            }
            if let Some(password) = role.password {
                store.set_password(&role.id, password);
            }
        }
        for resource in seed.resources {
            store.add_resource(resource.id.clone(), resource.annotations);
            for permit in resource.permits {
                store.permit(&permit.role, &permit.privilege, &resource.id);
            }
        }
        for (variable, value) in seed.secrets {
            store.set_secret(variable, value);
        }
        store
    }

    /// Load a YAML seed file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file cannot be read and [`Error::Config`]
    /// when it is not a valid seed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let seed: PolicySeed = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("policy file {}: {e}", path.display())))?;
        Ok(Self::from_seed(seed))
    }

    /// Add a role. Roles are resources too and carry the annotations.
    pub fn add_role(&self, id: ResourceId, annotations: BTreeMap<String, String>) {
        let mut state = self.state.write();
        state.roles.insert(id.clone());
        state.resources.insert(id, annotations);
    }

    /// Add a resource.
    pub fn add_resource(&self, id: ResourceId, annotations: BTreeMap<String, String>) {
        self.state.write().resources.insert(id, annotations);
    }

    /// Grant `privilege` on `resource` to `role`.
    pub fn permit(&self, role: &ResourceId, privilege: &str, resource: &ResourceId) {
        self.state
            .write()
            .permissions
            .insert((role.clone(), privilege.to_string(), resource.clone()));
    }

    /// Declare a variable, optionally with a value. Declaring also creates the
    /// variable resource.
    pub fn set_secret(&self, variable: ResourceId, value: Option<String>) {
        let mut state = self.state.write();
        state.resources.entry(variable.clone()).or_default();
        state.secrets.insert(variable, value);
    }

    /// Set a role's API key.
    pub fn set_api_key(&self, role: &ResourceId, key: String) {
        self.state.write().api_keys.insert(role.clone(), key);
    }

    /// Set a role's password.
    pub fn set_password(&self, role: &ResourceId, password: String) {
        self.state.write().passwords.insert(role.clone(), password);
    }
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn role_exists(&self, role: &ResourceId) -> Result<bool> {
        Ok(self.state.read().roles.contains(role))
    }

    async fn resource_exists(&self, resource: &ResourceId) -> Result<bool> {
        Ok(self.state.read().resources.contains_key(resource))
    }

    async fn allowed_to(
        &self,
        role: &ResourceId,
        privilege: &str,
        resource: &ResourceId,
    ) -> Result<bool> {
        let state = self.state.read();
        Ok(state
            .permissions
            .contains(&(role.clone(), privilege.to_string(), resource.clone())))
    }

    async fn annotations(&self, resource: &ResourceId) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.state.read().resources.get(resource).cloned())
    }

    async fn secret(&self, variable: &ResourceId) -> Result<SecretLookup> {
        let state = self.state.read();
        if !state.resources.contains_key(variable) {
            return Ok(SecretLookup::ResourceMissing);
        }
        Ok(match state.secrets.get(variable) {
            Some(Some(value)) => SecretLookup::Value(value.clone()),
            Some(None) | None => SecretLookup::NoValue,
        })
    }

    async fn webservices(&self, account: &str) -> Result<Vec<Webservice>> {
        let state = self.state.read();
        let mut found: Vec<Webservice> = state
            .resources
            .keys()
            .filter(|id| id.account() == account)
            .filter_map(webservice_from_resource)
            .collect();
        found.sort();
        Ok(found)
    }

    async fn create_webservice(
        &self,
        webservice: &Webservice,
        variables: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let resource = webservice.resource_id();
        if state.resources.contains_key(&resource) {
            debug!(webservice = %webservice, "Webservice already loaded");
            return Err(concurrent_load());
        }
        state.resources.insert(resource, BTreeMap::new());
        state
            .resources
            .insert(webservice.status_resource_id(), BTreeMap::new());
        for (name, value) in variables {
            let id = webservice.variable_id(&name);
            state.resources.insert(id.clone(), BTreeMap::new());
            state.secrets.insert(id, Some(value));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryPolicyStore {
    async fn api_key(&self, role: &ResourceId) -> Result<Option<String>> {
        Ok(self.state.read().api_keys.get(role).cloned())
    }

    async fn password_matches(&self, role: &ResourceId, password: &str) -> Result<bool> {
        let state = self.state.read();
        Ok(state
            .passwords
            .get(role)
            .is_some_and(|stored| stored.as_bytes().ct_eq(password.as_bytes()).into()))
    }
}
