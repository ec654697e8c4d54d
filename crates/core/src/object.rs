//! Object identity and the dual-state container the commit works on.

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

/// Label stamped on every object the pipeline writes for a capsule.
pub const OWNED_BY_LABEL: &str = "keel.dev/owned-by-capsule";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gvk {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Gvk of a typed k8s-openapi resource.
    pub fn of<K: k8s_openapi::Resource>() -> Self { Self::new(K::GROUP, K::VERSION, K::KIND) }

    /// Split an `apiVersion` string ("v1", "apps/v1") into a Gvk.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn group_kind(&self) -> GroupKind { GroupKind { group: self.group.clone(), kind: self.kind.clone() } }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl From<&Gvk> for GroupVersionKind {
    fn from(g: &Gvk) -> Self { GroupVersionKind::gvk(&g.group, &g.version, &g.kind) }
}

impl From<GroupVersionKind> for Gvk {
    fn from(g: GroupVersionKind) -> Self { Self { group: g.group, version: g.version, kind: g.kind } }
}

/// Version-less type identity, as stored in capsule status refs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Identity of one managed object within a reconciliation.
///
/// Ordering is by type first, then namespace and name; the commit walks keys
/// in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub gvk: Gvk,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: Gvk, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { gvk, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.gvk, self.name)
        } else {
            write!(f, "{} {}/{}", self.gvk, self.namespace, self.name)
        }
    }
}

/// Last observed (`current`) and computed (`desired`) state of one key.
///
/// `current` is `None` when the object is not owned yet. `desired` is `None`
/// when no step produced the object in this pass, meaning it gets deleted.
#[derive(Debug, Clone, Default)]
pub struct ManagedObject {
    pub current: Option<DynamicObject>,
    pub desired: Option<DynamicObject>,
}

impl ManagedObject {
    pub fn is_empty(&self) -> bool { self.current.is_none() && self.desired.is_none() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    Created,
    Updated,
    Deleted,
    Unchanged,
    AlreadyExists,
    ChangePending,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Created => "created",
            ResourceState::Updated => "updated",
            ResourceState::Deleted => "deleted",
            ResourceState::Unchanged => "unchanged",
            ResourceState::AlreadyExists => "alreadyExists",
            ResourceState::ChangePending => "changePending",
        };
        f.write_str(s)
    }
}

/// Outcome of committing one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub state: ResourceState,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Change {
    pub fn applied(state: ResourceState) -> Self { Self { state, applied: true, error: None } }

    pub fn planned(state: ResourceState) -> Self { Self { state, applied: false, error: None } }

    pub fn failed(state: ResourceState, error: impl Into<String>) -> Self {
        Self { state, applied: false, error: Some(error.into()) }
    }

    /// State as it should be reported on the capsule: a write that did not
    /// land is still pending.
    pub fn observed_state(&self) -> ResourceState {
        match self.state {
            ResourceState::Unchanged | ResourceState::AlreadyExists => self.state,
            s if self.applied => s,
            _ => ResourceState::ChangePending,
        }
    }
}
