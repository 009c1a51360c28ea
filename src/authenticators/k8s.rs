//! `authn-k8s`: a Kubernetes pod authenticates as the host of its application.
//!
//! The TLS terminator verifies the pod's client certificate and forwards its
//! SPIFFE ID (`spiffe://<trust-domain>/namespace/<ns>/pod/<name>`) in
//! [`POD_IDENTITY_HEADER`]. The URL username names the host. The host's
//! application identity is read from its annotations, or else from the last
//! three segments of its id (`<namespace>/<controller type>/<name>`, where
//! `*/*` admits the whole namespace). The pod must live in that namespace and
//! belong to that controller, as seen through the Kubernetes object API.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use authn_types::ResourceId;
use tracing::debug;
use url::Url;

use super::{Authenticator, RoleIdentity};
use crate::input::AuthenticatorInput;
use crate::policy::PolicyStore;
use crate::{Error, Result};

/// Authenticator type name.
pub const AUTHENTICATOR_NAME: &str = "authn-k8s";

/// Header carrying the SPIFFE ID of the verified client certificate.
pub const POD_IDENTITY_HEADER: &str = "x-ssl-client-spiffe-id";

const ANNOTATION_PREFIX: &str = "authn-k8s/";
const NAMESPACE_KEY: &str = "namespace";
const LABEL_SELECTOR_KEY: &str = "namespace-label-selector";

/// Kubernetes object kinds the authenticator reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// `Pod`
    Pod,
    /// `ReplicaSet`
    ReplicaSet,
    /// `Deployment`
    Deployment,
    /// `ReplicationController`
    ReplicationController,
    /// `DeploymentConfig` (OpenShift)
    DeploymentConfig,
    /// `StatefulSet`
    StatefulSet,
}

impl ObjectKind {
    /// Kind as it appears in owner references.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::ReplicaSet => "ReplicaSet",
            Self::Deployment => "Deployment",
            Self::ReplicationController => "ReplicationController",
            Self::DeploymentConfig => "DeploymentConfig",
            Self::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of `metadata.ownerReferences`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerReference {
    /// Owner kind, e.g. `ReplicaSet`.
    pub kind: String,
    /// Owner name.
    pub name: String,
}

impl OwnerReference {
    /// Reference to an owner of `kind`.
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            name: name.into(),
        }
    }
}

/// The parts of a Kubernetes object the resolvers read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sObject {
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`
    pub namespace: String,
    /// `metadata.ownerReferences`
    pub owner_references: Vec<OwnerReference>,
    /// `spec.serviceAccountName`, for pods.
    pub service_account_name: Option<String>,
}

impl K8sObject {
    fn owner(&self, kind: ObjectKind) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.kind == kind.as_str())
    }
}

/// Read access to the Kubernetes API.
#[async_trait::async_trait]
pub trait K8sObjectLookup: Send + Sync {
    /// The object of `kind` named `name` in `namespace`, or `None` when absent.
    /// Transport failures are [`Error::K8sApiUnavailable`].
    async fn find_object(&self, kind: ObjectKind, name: &str, namespace: &str) -> Result<Option<K8sObject>>;

    /// Labels of `namespace`, or `None` when the namespace does not exist.
    async fn namespace_labels(&self, namespace: &str) -> Result<Option<BTreeMap<String, String>>>;
}

/// Controller a host may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerType {
    /// Pods of a Deployment, through its ReplicaSets.
    Deployment,
    /// Pods of a DeploymentConfig, through its ReplicationControllers.
    DeploymentConfig,
    /// Pods of a ReplicaSet.
    ReplicaSet,
    /// Pods of a StatefulSet.
    StatefulSet,
    /// Pods running as a service account.
    ServiceAccount,
    /// A single pod.
    Pod,
}

impl ControllerType {
    const ALL: [Self; 6] = [
        Self::Deployment,
        Self::DeploymentConfig,
        Self::ReplicaSet,
        Self::StatefulSet,
        Self::ServiceAccount,
        Self::Pod,
    ];

    /// Parse `deployment`, `stateful_set`, `stateful-set`, ...
    ///
    /// # Errors
    ///
    /// [`Error::UnknownControllerType`] for anything else.
    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.annotation_key() == value.replace('_', "-"))
            .ok_or_else(|| Error::UnknownControllerType(value.to_string()))
    }

    fn annotation_key(self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::DeploymentConfig => "deployment-config",
            Self::ReplicaSet => "replica-set",
            Self::StatefulSet => "stateful-set",
            Self::ServiceAccount => "service-account",
            Self::Pod => "pod",
        }
    }
}

/// `key=value` pairs a namespace's labels must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    raw: String,
    pairs: Vec<(String, String)>,
}

impl LabelSelector {
    /// Parse `k1=v1,k2==v2`. Only equality is supported.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidLabelSelector`] for an empty selector, a part without a
    /// value or any other operator.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidLabelSelector(raw.to_string());
        if raw.trim().is_empty() {
            return Err(invalid());
        }
        let pairs = raw
            .split(',')
            .map(|part| {
                let (key, value) = part.split_once('=').ok_or_else(invalid)?;
                let value = value.strip_prefix('=').unwrap_or(value);
                let (key, value) = (key.trim(), value.trim());
                if key.is_empty() || key.ends_with('!') || value.contains('=') {
                    return Err(invalid());
                }
                Ok((key.to_string(), value.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            raw: raw.to_string(),
            pairs,
        })
    }

    /// Whether every pair is present in `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.pairs
            .iter()
            .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
    }
}

/// Where a host's pods may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    /// One named namespace.
    Name(String),
    /// Any namespace whose labels match.
    Labels(LabelSelector),
}

/// The Kubernetes application a host stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationIdentity {
    /// Namespace constraint.
    pub namespace: NamespaceScope,
    /// Controller constraint; `None` admits any pod in the namespace.
    pub controller: Option<(ControllerType, String)>,
}

impl ApplicationIdentity {
    /// Read from `authn-k8s/` annotations, where `authn-k8s/<service id>/<key>`
    /// wins over `authn-k8s/<key>`, falling back to the host id.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidApplicationIdentity`] when neither source is usable.
    pub fn read(role: &ResourceId, annotations: &BTreeMap<String, String>, service_id: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidApplicationIdentity {
            role: role.to_string(),
            reason: reason.to_string(),
        };
        let annotation = |key: &str| {
            annotations
                .get(&format!("{ANNOTATION_PREFIX}{service_id}/{key}"))
                .or_else(|| annotations.get(&format!("{ANNOTATION_PREFIX}{key}")))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let namespace = annotation(NAMESPACE_KEY);
        let selector = annotation(LABEL_SELECTOR_KEY);
        let controllers: Vec<(ControllerType, String)> = ControllerType::ALL
            .into_iter()
            .filter_map(|t| annotation(t.annotation_key()).map(|name| (t, name.to_string())))
            .collect();

        if namespace.is_none() && selector.is_none() && controllers.is_empty() {
            return Self::from_host_id(role)?.ok_or_else(|| {
                invalid("expected <namespace>/<controller type>/<name> or authn-k8s annotations")
            });
        }

        let namespace = match (namespace, selector) {
            (Some(name), None) => NamespaceScope::Name(name.to_string()),
            (None, Some(selector)) => NamespaceScope::Labels(LabelSelector::parse(selector)?),
            (Some(_), Some(_)) => return Err(invalid("namespace and namespace-label-selector are exclusive")),
            (None, None) => return Err(invalid("a namespace annotation is required")),
        };
        if controllers.len() > 1 {
            return Err(invalid("at most one controller annotation is allowed"));
        }
        Ok(Self {
            namespace,
            controller: controllers.into_iter().next(),
        })
    }

    fn from_host_id(role: &ResourceId) -> Result<Option<Self>> {
        let segments: Vec<&str> = role.id().rsplitn(4, '/').collect();
        let [name, controller, namespace, ..] = segments.as_slice() else {
            return Ok(None);
        };
        if namespace.is_empty() || *namespace == "*" {
            return Ok(None);
        }
        let controller = match (*controller, *name) {
            ("*", "*") => None,
            ("*", _) | (_, "*") => return Ok(None),
            (controller, name) => Some((ControllerType::parse(controller)?, name.to_string())),
        };
        Ok(Some(Self {
            namespace: NamespaceScope::Name((*namespace).to_string()),
            controller,
        }))
    }
}

/// `(namespace, pod name)` from a SPIFFE ID.
fn pod_from_spiffe_id(value: &str) -> Result<(String, String)> {
    let invalid = || Error::InvalidPodIdentity(format!("'{value}' is not a pod SPIFFE ID"));
    let url = Url::parse(value.trim()).map_err(|_| invalid())?;
    if url.scheme() != "spiffe" {
        return Err(invalid());
    }
    let segments: Vec<&str> = url.path_segments().ok_or_else(invalid)?.collect();
    match segments.as_slice() {
        ["namespace", namespace, "pod", pod] if !namespace.is_empty() && !pod.is_empty() => {
            Ok(((*namespace).to_string(), (*pod).to_string()))
        }
        _ => Err(invalid()),
    }
}

/// The `authn-k8s` authenticator.
pub struct K8sAuthenticator {
    store: Arc<dyn PolicyStore>,
    lookup: Arc<dyn K8sObjectLookup>,
}

impl K8sAuthenticator {
    /// Create over a policy store and a Kubernetes API client.
    pub fn new(store: Arc<dyn PolicyStore>, lookup: Arc<dyn K8sObjectLookup>) -> Self {
        Self { store, lookup }
    }

    async fn find(&self, kind: ObjectKind, name: &str, namespace: &str) -> Result<K8sObject> {
        self.lookup
            .find_object(kind, name, namespace)
            .await?
            .ok_or_else(|| Error::K8sObjectNotFound {
                kind: kind.as_str(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    /// Follow `child`'s owner reference of `kind`.
    async fn owner_of(&self, child: &K8sObject, kind: ObjectKind, pod: &K8sObject, hint: &str) -> Result<K8sObject> {
        let reference = child.owner(kind).ok_or_else(|| {
            Error::PodRelationMismatch(format!("Pod \"{}\" does not belong to a {hint}", pod.name))
        })?;
        self.find(kind, &reference.name, &pod.namespace).await
    }

    /// Whether `pod` belongs to the controller `name` of type `controller`.
    async fn validate_pod(&self, controller: ControllerType, name: &str, pod: &K8sObject) -> Result<()> {
        let (kind, actual) = match controller {
            ControllerType::Deployment => {
                let replica_set = self
                    .owner_of(pod, ObjectKind::ReplicaSet, pod, "ReplicaSet (or Deployment)")
                    .await?;
                let deployment = self
                    .owner_of(&replica_set, ObjectKind::Deployment, pod, "Deployment")
                    .await?;
                ("Deployment", deployment.name)
            }
            ControllerType::DeploymentConfig => {
                let controller = self
                    .owner_of(
                        pod,
                        ObjectKind::ReplicationController,
                        pod,
                        "ReplicationController (or DeploymentConfig)",
                    )
                    .await?;
                let config = self
                    .owner_of(&controller, ObjectKind::DeploymentConfig, pod, "DeploymentConfig")
                    .await?;
                ("DeploymentConfig", config.name)
            }
            ControllerType::ReplicaSet => {
                let replica_set = self.owner_of(pod, ObjectKind::ReplicaSet, pod, "ReplicaSet").await?;
                ("ReplicaSet", replica_set.name)
            }
            ControllerType::StatefulSet => {
                let stateful_set = self.owner_of(pod, ObjectKind::StatefulSet, pod, "StatefulSet").await?;
                ("StatefulSet", stateful_set.name)
            }
            ControllerType::ServiceAccount => (
                "ServiceAccount",
                pod.service_account_name.clone().unwrap_or_default(),
            ),
            ControllerType::Pod => ("Pod", pod.name.clone()),
        };

        if actual != name {
            return Err(Error::PodRelationMismatch(format!(
                "Pod \"{}\" {kind} is \"{actual}\", not \"{name}\"",
                pod.name
            )));
        }
        Ok(())
    }

    async fn validate_namespace(&self, scope: &NamespaceScope, pod: &K8sObject) -> Result<()> {
        match scope {
            NamespaceScope::Name(expected) if *expected == pod.namespace => Ok(()),
            NamespaceScope::Name(expected) => Err(Error::NamespaceMismatch {
                expected: expected.clone(),
                actual: pod.namespace.clone(),
            }),
            NamespaceScope::Labels(selector) => {
                let labels = self
                    .lookup
                    .namespace_labels(&pod.namespace)
                    .await?
                    .unwrap_or_default();
                if selector.matches(&labels) {
                    Ok(())
                } else {
                    Err(Error::LabelSelectorMismatch {
                        namespace: pod.namespace.clone(),
                        selector: selector.raw.clone(),
                    })
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for K8sAuthenticator {
    fn name(&self) -> &'static str {
        AUTHENTICATOR_NAME
    }

    async fn verify(&self, input: &AuthenticatorInput) -> Result<RoleIdentity> {
        let webservice = input.webservice()?;
        let role = input
            .claimed_role()
            .ok_or_else(|| Error::MissingRequestParam("username".to_string()))?;
        if role.kind() != "host" {
            return Err(Error::InvalidApplicationIdentity {
                role: role.to_string(),
                reason: "only hosts authenticate with authn-k8s".to_string(),
            });
        }

        let spiffe_id = input
            .headers()
            .get(POD_IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::InvalidPodIdentity(format!("{POD_IDENTITY_HEADER} header is missing")))?;
        let (namespace, pod_name) = pod_from_spiffe_id(spiffe_id)?;
        let pod = self
            .lookup
            .find_object(ObjectKind::Pod, &pod_name, &namespace)
            .await?
            .ok_or(Error::PodNotFound {
                name: pod_name,
                namespace,
            })?;

        let annotations = self.store.annotations(&role).await?.unwrap_or_default();
        let identity = ApplicationIdentity::read(&role, &annotations, webservice.service_id().unwrap_or_default())?;
        self.validate_namespace(&identity.namespace, &pod).await?;
        if let Some((controller, name)) = &identity.controller {
            self.validate_pod(*controller, name, &pod).await?;
        }

        debug!(webservice = %webservice, role = %role, pod = %pod.name, "Pod validated");
        Ok(RoleIdentity::new(role))
    }
}
