//! The `Capsule` custom resource: the subject of every reconciliation.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::object::{GroupKind, ResourceState};

/// Workload descriptor. The engine treats the spec as opaque and hands it to
/// mods; only the built-in mods read individual fields.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "Capsule",
    namespaced,
    status = "CapsuleStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CapsuleInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<CronJobSpec>,
}

/// Namespace a capsule without one reconciles into.
pub const DEFAULT_NAMESPACE: &str = "default";

impl Capsule {
    /// Namespace the capsule's objects live in; matching uses the same value.
    pub fn effective_namespace(&self) -> String {
        match self.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleInterface {
    pub name: String,
    pub port: i32,
}

/// A ConfigMap or Secret whose keys are exposed as environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSource {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub name: String,
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub owned_resources: Vec<OwnedResource>,
    #[serde(default)]
    pub used_resources: Vec<UsedResource>,
    /// Always serialized so a merge patch clears errors from an earlier run.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Version-less reference to an object in the capsule namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), name: name.into() }
    }

    pub fn group_kind(&self) -> GroupKind { GroupKind { group: self.group.clone(), kind: self.kind.clone() } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedResource {
    #[serde(rename = "ref")]
    pub reference: ResourceRef,
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An object a mod read but does not own, surfaced for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedResource {
    #[serde(rename = "ref")]
    pub reference: ResourceRef,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
