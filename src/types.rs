//! Identities of tenants, resource types and cached objects.

use std::{collections::HashSet, fmt};

use kube_core::{DynamicObject, Resource};
use serde::{Deserialize, Serialize};

/// The annotation carrying the logical cluster (tenant) an object lives in.
pub const CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

/// Identifies a tenant (workspace), e.g. `root:org:team`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniquely identifies a watchable type of resources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTypeKey {
    /// The group of the resource type, or empty string for the core group.
    pub group: String,
    /// The API version within the group.
    pub version: String,
    /// The plural name of the resource type.
    pub resource: String,
}

impl ResourceTypeKey {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// The key of a statically known type.
    pub fn of<K: k8s_openapi::Resource>() -> Self {
        Self::new(K::GROUP, K::VERSION, K::URL_PATH_SEGMENT)
    }

    /// Checks that the key can address a list+watch endpoint.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.version.is_empty() {
            return Err("version is empty");
        }
        if self.resource.is_empty() {
            return Err("resource is empty");
        }
        if self.resource.contains('/') {
            return Err("subresources cannot be watched");
        }
        if self.group.contains('/') || self.version.contains('/') {
            return Err("group and version must not contain '/'");
        }
        Ok(())
    }
}

impl fmt::Display for ResourceTypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

/// A resource type as reported by discovery for one tenant.
///
/// Only used while computing a [`DiscoveredSet`]; recomputed every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeDescriptor {
    pub key: ResourceTypeKey,
    pub kind: String,
    pub namespaced: bool,
    /// The verbs supported by the endpoint, e.g. `list`, `watch`.
    pub verbs: Vec<String>,
}

impl ResourceTypeDescriptor {
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    /// Whether a watch should be kept for this type.
    ///
    /// Cluster-scoped types, subresources and types lacking either `list` or `watch` are skipped.
    pub fn is_watchable(&self) -> bool {
        self.namespaced
            && !self.key.resource.contains('/')
            && self.supports("list")
            && self.supports("watch")
    }
}

/// The union of watchable types over all tenants in one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredSet(HashSet<ResourceTypeKey>);

impl DiscoveredSet {
    pub fn contains(&self, key: &ResourceTypeKey) -> bool {
        self.0.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceTypeKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, key: ResourceTypeKey) -> bool {
        self.0.insert(key)
    }
}

impl FromIterator<ResourceTypeKey> for DiscoveredSet {
    fn from_iter<I: IntoIterator<Item = ResourceTypeKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Uniquely identifies an object of a watched type by tenant, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The logical cluster from [`CLUSTER_ANNOTATION`], if any
    pub cluster: Option<String>,
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    /// Returns `None` for objects without a name.
    pub fn from_object(object: &DynamicObject) -> Option<Self> {
        let meta = object.meta();
        Some(Self {
            cluster: meta
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(CLUSTER_ANNOTATION))
                .cloned(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cluster) = &self.cluster {
            write!(f, "{cluster}|")?;
        }
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        f.write_str(&self.name)
    }
}
