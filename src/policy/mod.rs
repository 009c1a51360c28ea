//! Policy store: roles, resources, annotations, secrets and RBAC.
//!
//! The authenticator core only reads policy. The [`PolicyStore`] trait is the
//! seam to whatever backs the policy engine; [`InMemoryPolicyStore`] is the
//! implementation used by the binary (seeded from YAML) and by tests.

mod memory;

use std::collections::BTreeMap;

use authn_types::{ResourceId, Webservice};
use rand::RngExt;

use crate::{Error, Result};

pub use memory::{InMemoryPolicyStore, PolicySeed};

/// Privilege a role needs on a webservice to authenticate through it.
pub const AUTHENTICATE_PRIVILEGE: &str = "authenticate";

/// Privilege a role needs on a webservice's status resource.
pub const READ_PRIVILEGE: &str = "read";

/// Privilege a role needs on the root policy to create webservices.
pub const UPDATE_PRIVILEGE: &str = "update";

/// Outcome of a secret lookup. Distinguishes a missing variable from a
/// variable that exists but has no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretLookup {
    /// No variable resource with this id.
    ResourceMissing,
    /// The variable exists but no value has been stored.
    NoValue,
    /// The current value.
    Value(String),
}

/// Trait abstracting the policy engine.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// concurrent requests.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Whether a role with this id exists.
    async fn role_exists(&self, role: &ResourceId) -> Result<bool>;

    /// Whether a resource with this id exists.
    async fn resource_exists(&self, resource: &ResourceId) -> Result<bool>;

    /// RBAC check: does `role` hold `privilege` on `resource`.
    async fn allowed_to(
        &self,
        role: &ResourceId,
        privilege: &str,
        resource: &ResourceId,
    ) -> Result<bool>;

    /// Annotations of a resource, or `None` when the resource does not exist.
    async fn annotations(&self, resource: &ResourceId) -> Result<Option<BTreeMap<String, String>>>;

    /// Current value of a variable.
    async fn secret(&self, variable: &ResourceId) -> Result<SecretLookup>;

    /// Every webservice defined for the account.
    async fn webservices(&self, account: &str) -> Result<Vec<Webservice>>;

    /// Materialize a webservice and its configuration variables.
    ///
    /// A uniqueness violation against a concurrent load surfaces as
    /// [`Error::ConcurrentLoad`]; the caller owns the retry.
    async fn create_webservice(
        &self,
        webservice: &Webservice,
        variables: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Credentials used by the default authenticator.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// API key of a role, if one was issued.
    async fn api_key(&self, role: &ResourceId) -> Result<Option<String>>;

    /// Whether `password` is the role's password. Must compare in constant time.
    async fn password_matches(&self, role: &ResourceId, password: &str) -> Result<bool>;
}

/// Build the [`Error::ConcurrentLoad`] a store returns on a uniqueness race,
/// with a randomized 1-8 second retry hint.
#[must_use]
pub fn concurrent_load() -> Error {
    Error::ConcurrentLoad {
        retry_after: rand::rng().random_range(1..=8),
    }
}

/// Parse `conjur/<type>[/<service_id>]` webservice resource ids. Status
/// resources and non-authenticator webservices yield `None`.
pub(crate) fn webservice_from_resource(id: &ResourceId) -> Option<Webservice> {
    if id.kind() != "webservice" {
        return None;
    }
    let name = id.id().strip_prefix("conjur/")?;
    if !name.starts_with("authn") || name.ends_with("/status") {
        return None;
    }
    Webservice::parse(id.account(), name).ok()
}
