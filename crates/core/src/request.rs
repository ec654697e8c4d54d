//! Object access a mod gets during one reconciliation pass.
//!
//! The host's transaction implements this directly; out-of-process mods get a
//! proxy that forwards every call over the mod protocol. These four calls are
//! the whole capability surface of a mod.

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde::{de::DeserializeOwned, Serialize};

use crate::capsule::UsedResource;
use crate::error::Result;
use crate::object::Gvk;

#[async_trait]
pub trait CapsuleRequest: Send {
    /// Object as last observed in the cluster, if the capsule owns it.
    async fn get_current(&mut self, gvk: &Gvk, name: &str) -> Result<Option<DynamicObject>>;

    /// Object as computed so far in this pass.
    async fn get_new(&mut self, gvk: &Gvk, name: &str) -> Result<Option<DynamicObject>>;

    /// Set the desired state of an object, replacing any earlier value.
    async fn set(&mut self, obj: DynamicObject) -> Result<()>;

    /// Drop the desired state of an object so the commit deletes it.
    async fn delete(&mut self, gvk: &Gvk, name: &str) -> Result<()>;

    /// Record an object the mod depends on but does not own.
    async fn mark_used_resource(&mut self, used: UsedResource) -> Result<()>;
}

/// Set a typed k8s-openapi object.
pub async fn set_typed<K>(req: &mut dyn CapsuleRequest, obj: &K) -> Result<()>
where
    K: Serialize + Sync,
{
    let dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    req.set(dynamic).await
}

/// Desired value of a typed object, if set in this pass.
pub async fn get_new_typed<K>(req: &mut dyn CapsuleRequest, name: &str) -> Result<Option<K>>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    match req.get_new(&Gvk::of::<K>(), name).await? {
        Some(obj) => Ok(Some(serde_json::from_value(serde_json::to_value(obj)?)?)),
        None => Ok(None),
    }
}
