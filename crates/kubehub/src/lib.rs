//! Keel kubehub: the cluster client the engine commits through.
//!
//! The engine never talks to the API server directly; it holds an
//! `Arc<dyn ClusterClient>`. `KubeCluster` is the kube-rs implementation and
//! `MemoryCluster` an in-memory double for tests and demos.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::core::DynamicObject;

use keel_core::{Capsule, CapsuleStatus, Error, ObjectKey};

mod kube_cluster;
pub mod memory;

pub use kube_cluster::{get_kube_client, KubeCluster};
pub use memory::MemoryCluster;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api: {0}")]
    Api(String),
}

impl From<ClusterError> for Error {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(m) => Error::NotFound(m),
            ClusterError::AlreadyExists(m) | ClusterError::Conflict(m) => Error::Aborted(m),
            ClusterError::Api(m) => Error::Unavailable(m),
        }
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ClusterError>;

    /// Create an object. With `dry_run` the server validates without persisting,
    /// which is how the commit checks for foreign objects.
    async fn create(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, ClusterError>;

    /// Replace an object. A `resourceVersion` on `obj` makes this conditional.
    async fn update(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError>;

    /// Write the status sub-resource of a capsule.
    async fn update_status(&self, capsule: &Capsule, status: &CapsuleStatus) -> Result<(), ClusterError>;
}
