//! Keel core types: object model, the Capsule resource, the kind registry and
//! the contract between the engine and its mods.

#![forbid(unsafe_code)]

pub mod capsule;
pub mod error;
pub mod object;
pub mod plugin;
pub mod request;
pub mod scheme;

pub use capsule::{Capsule, CapsuleInterface, CapsuleSpec, CapsuleStatus, CronJobSpec, EnvSource, DEFAULT_NAMESPACE, OwnedResource, ResourceRef, UsedResource};
pub use error::{Error, Result};
pub use object::{Change, GroupKind, Gvk, ManagedObject, ObjectKey, ResourceState, OWNED_BY_LABEL};
pub use plugin::Mod;
pub use request::CapsuleRequest;
pub use scheme::{Compare, KindInfo, Scheme};

pub mod prelude {
    pub use super::{
        Capsule, CapsuleRequest, Change, Error, Gvk, Mod, ObjectKey, ResourceState, Result, Scheme, UsedResource,
    };
    pub use kube::core::DynamicObject;
}
