//! One reconciliation transaction.
//!
//! A `Request` tracks, per object key, the state last observed in the cluster
//! (`current`, loaded once from the capsule's owned-resource refs) and the state
//! the steps computed in the running pass (`desired`). `commit` turns the
//! difference into creates, updates and deletes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, info, warn};

use keel_core::{
    Capsule, CapsuleRequest, Change, Compare, Error, Gvk, ManagedObject, ObjectKey, ResourceState, Result, Scheme,
    UsedResource, OWNED_BY_LABEL,
};
use keel_kubehub::{ClusterClient, ClusterError};

use crate::compare::objects_equal;
use crate::result::{InputObject, OutputObject, PipelineResult};

pub struct Request {
    capsule: Capsule,
    namespace: String,
    client: Arc<dyn ClusterClient>,
    scheme: Arc<Scheme>,
    objects: BTreeMap<ObjectKey, ManagedObject>,
    used: Vec<UsedResource>,
    force_adopt: bool,
}

impl Request {
    pub fn new(capsule: Capsule, client: Arc<dyn ClusterClient>, scheme: Arc<Scheme>) -> Self {
        let namespace = capsule.effective_namespace();
        Self { capsule, namespace, client, scheme, objects: BTreeMap::new(), used: Vec::new(), force_adopt: false }
    }

    /// Treat existing objects that the capsule does not own as adopted instead of aborting.
    pub fn with_force_adopt(mut self, force_adopt: bool) -> Self {
        self.force_adopt = force_adopt;
        self
    }

    pub fn capsule(&self) -> &Capsule { &self.capsule }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn objects(&self) -> &BTreeMap<ObjectKey, ManagedObject> { &self.objects }

    pub fn used_resources(&self) -> &[UsedResource] { &self.used }

    /// Fetch every object listed in the capsule's owned resources.
    ///
    /// Objects that no longer exist are dropped; kinds the scheme does not
    /// know are skipped since they can be neither compared nor deleted.
    pub async fn load_existing(&mut self) -> Result<()> {
        let owned = self.capsule.status.as_ref().map(|s| s.owned_resources.clone()).unwrap_or_default();
        for res in owned {
            let gk = res.reference.group_kind();
            let Some(info) = self.scheme.lookup_group_kind(&gk) else {
                warn!(capsule = %self.capsule.name_any(), kind = %gk, name = %res.reference.name, "skipping owned resource of unknown kind");
                continue;
            };
            let ns = if info.namespaced { self.namespace.clone() } else { String::new() };
            let key = ObjectKey::new(info.gvk.clone(), ns, res.reference.name.clone());
            if self.objects.contains_key(&key) {
                continue;
            }
            match self.client.get(&key).await {
                Ok(Some(obj)) => {
                    self.objects.insert(key, ManagedObject { current: Some(obj), desired: None });
                }
                Ok(None) | Err(ClusterError::NotFound(_)) => {
                    debug!(key = %key, "owned object is gone");
                }
                Err(e) => return Err(Error::from(e).context(format!("loading {key}"))),
            }
        }
        debug!(capsule = %self.capsule.name_any(), loaded = self.objects.len(), "loaded existing objects");
        Ok(())
    }

    /// Start a new pass: forget everything the previous pass computed.
    pub fn prepare(&mut self) -> PipelineResult {
        self.objects.retain(|_, m| m.current.is_some());
        let mut input_objects = Vec::with_capacity(self.objects.len());
        for (key, m) in self.objects.iter_mut() {
            m.desired = None;
            if let Some(cur) = &m.current {
                input_objects.push(InputObject { key: key.clone(), object: cur.clone() });
            }
        }
        self.used.clear();
        PipelineResult { input_objects, ..Default::default() }
    }

    fn key_for(&self, gvk: &Gvk, name: &str) -> Result<ObjectKey> {
        let info = self
            .scheme
            .lookup(gvk)
            .ok_or_else(|| Error::InvalidArgument(format!("kind {gvk} is not registered")))?;
        let ns = if info.namespaced { self.namespace.clone() } else { String::new() };
        Ok(ObjectKey::new(gvk.clone(), ns, name))
    }

    /// Bring `obj` into the shape the commit expects: capsule namespace,
    /// ownership label, no server-populated fields.
    fn normalize(&self, mut obj: DynamicObject) -> Result<(ObjectKey, DynamicObject)> {
        let gvk = self.scheme.object_kind(&obj)?;
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("{gvk} object has no name")))?;
        let key = self.key_for(&gvk, &name)?;
        match obj.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() && ns != key.namespace => {
                return Err(Error::InvalidArgument(format!(
                    "{gvk} {name} targets namespace {ns}, capsule lives in {}",
                    self.namespace
                )));
            }
            _ => {}
        }
        obj.metadata.namespace = if key.namespace.is_empty() { None } else { Some(key.namespace.clone()) };
        obj.metadata.labels.get_or_insert_with(BTreeMap::new).insert(OWNED_BY_LABEL.to_string(), self.capsule.name_any());
        obj.metadata.resource_version = None;
        obj.metadata.uid = None;
        obj.metadata.generation = None;
        obj.metadata.creation_timestamp = None;
        obj.metadata.managed_fields = None;
        if let Some(data) = obj.data.as_object_mut() {
            data.remove("status");
        }
        Ok((key, obj))
    }

    /// Apply the difference between desired and current state.
    ///
    /// Untracked keys are checked with a dry-run create first. An existing
    /// object carrying this capsule's owner label is reclaimed and compared
    /// like any tracked object; anything else belongs to someone else and
    /// aborts the commit unless force-adopt is on. With `dry_run` nothing is
    /// written and every change is reported as planned.
    pub async fn commit(&mut self, dry_run: bool) -> Result<BTreeMap<ObjectKey, Change>> {
        let mut changes = BTreeMap::new();
        let mut adopted = BTreeSet::new();
        let mut reclaimed = Vec::new();
        let capsule_name = self.capsule.name_any();

        for (key, m) in &self.objects {
            let (None, Some(desired)) = (&m.current, &m.desired) else { continue };
            let msg = match self.client.create(key, desired, true).await {
                Ok(_) => continue,
                Err(ClusterError::AlreadyExists(msg)) => msg,
                Err(e) => {
                    changes.insert(key.clone(), Change::failed(ResourceState::Created, e.to_string()));
                    continue;
                }
            };
            let existing = match self.client.get(key).await {
                Ok(existing) => existing,
                Err(e) => {
                    changes.insert(key.clone(), Change::failed(ResourceState::Created, e.to_string()));
                    continue;
                }
            };
            match existing {
                Some(obj) if obj.labels().get(OWNED_BY_LABEL) == Some(&capsule_name) => {
                    info!(key = %key, "reclaiming object labeled for this capsule");
                    reclaimed.push((key.clone(), obj));
                }
                _ if self.force_adopt => {
                    info!(key = %key, reason = %msg, "adopting existing object");
                    adopted.insert(key.clone());
                }
                _ => {
                    return Err(Error::Aborted(format!("{key} exists but is not owned by capsule {capsule_name}: {msg}")));
                }
            }
        }
        for (key, obj) in reclaimed {
            if let Some(m) = self.objects.get_mut(&key) {
                m.current = Some(obj);
            }
        }

        for (key, m) in self.objects.iter_mut() {
            if changes.contains_key(key) {
                continue;
            }
            if adopted.contains(key) {
                changes.insert(key.clone(), Change::planned(ResourceState::AlreadyExists));
                continue;
            }
            let change = match (&m.current, &m.desired) {
                (None, None) => continue,
                (Some(_), None) => {
                    if dry_run {
                        Change::planned(ResourceState::Deleted)
                    } else {
                        match self.client.delete(key).await {
                            Ok(()) | Err(ClusterError::NotFound(_)) => Change::applied(ResourceState::Deleted),
                            Err(e) => Change::failed(ResourceState::Deleted, e.to_string()),
                        }
                    }
                }
                (None, Some(desired)) => {
                    if dry_run {
                        Change::planned(ResourceState::Created)
                    } else {
                        match self.client.create(key, desired, false).await {
                            Ok(created) => {
                                m.current = Some(created);
                                Change::applied(ResourceState::Created)
                            }
                            Err(ClusterError::AlreadyExists(msg)) => {
                                return Err(Error::Aborted(format!("{key} appeared during commit: {msg}")));
                            }
                            Err(e) => Change::failed(ResourceState::Created, e.to_string()),
                        }
                    }
                }
                (Some(current), Some(desired)) => {
                    let policy = self.scheme.lookup(&key.gvk).map_or(Compare::Full, |i| i.compare);
                    if objects_equal(policy, current, desired) {
                        if dry_run {
                            Change::planned(ResourceState::Unchanged)
                        } else {
                            Change::applied(ResourceState::Unchanged)
                        }
                    } else if dry_run {
                        Change::planned(ResourceState::Updated)
                    } else {
                        let mut update = desired.clone();
                        update.metadata.resource_version = current.metadata.resource_version.clone();
                        match self.client.update(key, &update).await {
                            Ok(updated) => {
                                m.current = Some(updated);
                                Change::applied(ResourceState::Updated)
                            }
                            Err(ClusterError::Conflict(msg)) | Err(ClusterError::NotFound(msg)) => {
                                // Re-observe the key so the next pass updates against fresh state.
                                m.current = self.client.get(key).await.ok().flatten();
                                return Err(Error::Aborted(format!("{key} changed during commit: {msg}")));
                            }
                            Err(e) => Change::failed(ResourceState::Updated, e.to_string()),
                        }
                    }
                }
            };
            counter!("commit_changes_total", 1u64, "state" => change.state.to_string());
            if let Some(err) = &change.error {
                warn!(key = %key, state = %change.state, error = %err, "object change failed");
            }
            changes.insert(key.clone(), change);
        }
        Ok(changes)
    }

    /// Pair each committed key with the object it refers to.
    pub fn outputs(&self, changes: &BTreeMap<ObjectKey, Change>) -> Vec<OutputObject> {
        changes
            .iter()
            .filter_map(|(key, change)| {
                let m = self.objects.get(key)?;
                let object = m.desired.clone().or_else(|| m.current.clone())?;
                Some(OutputObject { key: key.clone(), object, change: change.clone() })
            })
            .collect()
    }
}

#[async_trait]
impl CapsuleRequest for Request {
    async fn get_current(&mut self, gvk: &Gvk, name: &str) -> Result<Option<DynamicObject>> {
        let key = self.key_for(gvk, name)?;
        Ok(self.objects.get(&key).and_then(|m| m.current.clone()))
    }

    async fn get_new(&mut self, gvk: &Gvk, name: &str) -> Result<Option<DynamicObject>> {
        let key = self.key_for(gvk, name)?;
        Ok(self.objects.get(&key).and_then(|m| m.desired.clone()))
    }

    async fn set(&mut self, obj: DynamicObject) -> Result<()> {
        let (key, obj) = self.normalize(obj)?;
        self.objects.entry(key).or_default().desired = Some(obj);
        Ok(())
    }

    async fn delete(&mut self, gvk: &Gvk, name: &str) -> Result<()> {
        let key = self.key_for(gvk, name)?;
        if let Some(m) = self.objects.get_mut(&key) {
            m.desired = None;
        }
        Ok(())
    }

    async fn mark_used_resource(&mut self, used: UsedResource) -> Result<()> {
        match self.used.iter_mut().find(|u| u.reference == used.reference) {
            Some(existing) => *existing = used,
            None => self.used.push(used),
        }
        Ok(())
    }
}
