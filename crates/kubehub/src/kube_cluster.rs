use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tracing::{debug, info};

use keel_core::{Capsule, CapsuleStatus, Gvk, ObjectKey, Scheme};

use crate::{ClusterClient, ClusterError};

const FIELD_MANAGER: &str = "keel";

pub async fn get_kube_client() -> anyhow::Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Cluster client backed by kube-rs dynamic objects.
///
/// Kinds known to the scheme resolve without a round trip; anything else
/// falls back to discovery, cached per Gvk.
pub struct KubeCluster {
    client: Client,
    scheme: Arc<Scheme>,
    discovered: RwLock<HashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client, scheme: Arc<Scheme>) -> Self {
        Self { client, scheme, discovered: RwLock::new(HashMap::new()) }
    }

    pub async fn try_default(scheme: Arc<Scheme>) -> anyhow::Result<Self> {
        Ok(Self::new(get_kube_client().await?, scheme))
    }

    pub fn client(&self) -> &Client { &self.client }

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(info) = self.scheme.lookup(gvk) {
            return Ok((info.api_resource(), info.namespaced));
        }
        if let Some(hit) = self.discovered.read().await.get(gvk) {
            return Ok(hit.clone());
        }
        let found = find_api_resource(self.client.clone(), &gvk.into()).await?;
        debug!(gvk = %gvk, plural = %found.0.plural, "discovered api resource");
        self.discovered.write().await.insert(gvk.clone(), found.clone());
        Ok(found)
    }

    async fn api(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), &key.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), ClusterError> {
    let discovery = Discovery::new(client).run().await.map_err(map_kube_err)?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(ClusterError::NotFound(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

pub(crate) fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => ClusterError::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
        other => ClusterError::Api(other.to_string()),
    }
}

fn observe(op: &'static str, t0: Instant, ok: bool) {
    histogram!("cluster_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    if !ok {
        counter!("cluster_request_errors_total", 1u64, "op" => op);
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ClusterError> {
        let t0 = Instant::now();
        let res = self.api(key).await?.get_opt(&key.name).await.map_err(map_kube_err);
        observe("get", t0, res.is_ok());
        res
    }

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, ClusterError> {
        let t0 = Instant::now();
        let pp = PostParams { dry_run, field_manager: Some(FIELD_MANAGER.to_string()) };
        let res = self.api(key).await?.create(&pp, obj).await.map_err(map_kube_err);
        observe(if dry_run { "create_dry" } else { "create" }, t0, res.is_ok());
        res
    }

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let t0 = Instant::now();
        let pp = PostParams { dry_run: false, field_manager: Some(FIELD_MANAGER.to_string()) };
        let res = self.api(key).await?.replace(&key.name, &pp, obj).await.map_err(map_kube_err);
        observe("update", t0, res.is_ok());
        res
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let t0 = Instant::now();
        let res = self.api(key).await?.delete(&key.name, &DeleteParams::background()).await.map(|_| ()).map_err(map_kube_err);
        observe("delete", t0, res.is_ok());
        res
    }

    async fn update_status(&self, capsule: &Capsule, status: &CapsuleStatus) -> Result<(), ClusterError> {
        let t0 = Instant::now();
        let ns = capsule.namespace().unwrap_or_default();
        let name = capsule.name_any();
        let api: Api<Capsule> = Api::namespaced(self.client.clone(), &ns);
        let patch = serde_json::json!({ "status": status });
        let res = api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)).await.map(|_| ()).map_err(map_kube_err);
        observe("update_status", t0, res.is_ok());
        if res.is_ok() {
            info!(capsule = %name, ns = %ns, owned = status.owned_resources.len(), errors = status.errors.len(), "capsule status written");
        }
        res
    }
}
