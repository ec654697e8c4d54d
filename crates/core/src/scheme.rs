//! Registry of the kinds the engine can manage.
//!
//! Owned-resource refs in capsule status carry only group and kind, so the
//! registry maps those back to a preferred version. It also carries the plural
//! (to build API paths without discovery) and the comparison policy used at
//! commit time.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::core::{ApiResource, DynamicObject};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::object::{GroupKind, Gvk, ObjectKey};

/// How the commit decides whether current and desired differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    /// Labels plus the fields set in the desired `spec`.
    Spec,
    /// Whole object minus server-populated fields.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindInfo {
    pub gvk: Gvk,
    pub plural: String,
    pub namespaced: bool,
    pub compare: Compare,
}

impl KindInfo {
    pub fn api_resource(&self) -> ApiResource { ApiResource::from_gvk_with_plural(&(&self.gvk).into(), &self.plural) }
}

#[derive(Debug, Clone, Default)]
pub struct Scheme {
    by_gvk: FxHashMap<Gvk, KindInfo>,
    by_group_kind: FxHashMap<GroupKind, Gvk>,
}

impl Scheme {
    pub fn new() -> Self { Self::default() }

    /// Kinds produced by the built-in mods and the usual add-ons.
    pub fn with_defaults() -> Self {
        let mut s = Self::new();
        s.register_namespaced::<Deployment>(Compare::Spec)
            .register_namespaced::<Service>(Compare::Spec)
            .register_namespaced::<ConfigMap>(Compare::Full)
            .register_namespaced::<Secret>(Compare::Full)
            .register_namespaced::<ServiceAccount>(Compare::Full)
            .register_namespaced::<Ingress>(Compare::Spec)
            .register_namespaced::<HorizontalPodAutoscaler>(Compare::Spec)
            .register_namespaced::<CronJob>(Compare::Spec)
            .register_namespaced::<PodDisruptionBudget>(Compare::Spec);
        s.register(KindInfo {
            gvk: Gvk::new("cert-manager.io", "v1", "Certificate"),
            plural: "certificates".into(),
            namespaced: true,
            compare: Compare::Spec,
        });
        s.register(KindInfo {
            gvk: Gvk::new("monitoring.coreos.com", "v1", "ServiceMonitor"),
            plural: "servicemonitors".into(),
            namespaced: true,
            compare: Compare::Spec,
        });
        s
    }

    /// Register a kind. A later registration for the same group/kind becomes
    /// the preferred version.
    pub fn register(&mut self, info: KindInfo) -> &mut Self {
        self.by_group_kind.insert(info.gvk.group_kind(), info.gvk.clone());
        self.by_gvk.insert(info.gvk.clone(), info);
        self
    }

    pub fn register_namespaced<K>(&mut self, compare: Compare) -> &mut Self
    where
        K: k8s_openapi::Resource<Scope = NamespaceResourceScope>,
    {
        self.register(KindInfo { gvk: Gvk::of::<K>(), plural: K::URL_PATH_SEGMENT.to_string(), namespaced: true, compare })
    }

    pub fn lookup(&self, gvk: &Gvk) -> Option<&KindInfo> { self.by_gvk.get(gvk) }

    /// Resolve a version-less reference to the preferred registered kind.
    pub fn lookup_group_kind(&self, gk: &GroupKind) -> Option<&KindInfo> {
        self.by_group_kind.get(gk).and_then(|gvk| self.by_gvk.get(gvk))
    }

    /// Gvk of an object value, taken from its type meta. The kind must be registered.
    pub fn object_kind(&self, obj: &DynamicObject) -> Result<Gvk> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("object is missing apiVersion/kind".into()))?;
        if types.kind.is_empty() || types.api_version.is_empty() {
            return Err(Error::InvalidArgument("object is missing apiVersion/kind".into()));
        }
        let gvk = Gvk::from_api_version(&types.api_version, &types.kind);
        if !self.by_gvk.contains_key(&gvk) {
            return Err(Error::InvalidArgument(format!("kind {} is not registered", gvk)));
        }
        Ok(gvk)
    }

    /// Empty object of a registered kind.
    pub fn new_object(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<DynamicObject> {
        let info = self.lookup(gvk).ok_or_else(|| Error::InvalidArgument(format!("kind {} is not registered", gvk)))?;
        let obj = DynamicObject::new(name, &info.api_resource());
        Ok(if info.namespaced { obj.within(namespace) } else { obj })
    }

    pub fn object_key(&self, obj: &DynamicObject) -> Result<ObjectKey> {
        let gvk = self.object_kind(obj)?;
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("{} object has no name", gvk)))?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        Ok(ObjectKey { gvk, namespace, name })
    }
}
