//! In-memory cluster double.
//!
//! Mimics the API server behaviors the commit relies on: dry-run creates,
//! `AlreadyExists` on duplicate creates, optimistic concurrency on
//! `resourceVersion`, and server-populated metadata. Conflicts can be
//! injected to exercise the pipeline's retry loop.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use kube::ResourceExt;

use keel_core::{Capsule, CapsuleStatus, ObjectKey};

use crate::{ClusterClient, ClusterError};

/// One call observed by the double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ObjectKey),
    Create { key: ObjectKey, dry_run: bool },
    Update(ObjectKey),
    Delete(ObjectKey),
    UpdateStatus { namespace: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflicts {
    Never,
    Next(usize),
    Always,
}

struct Inner {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    statuses: BTreeMap<(String, String), CapsuleStatus>,
    calls: Vec<Call>,
    next_rv: u64,
    conflicts: Conflicts,
    fail_status: bool,
}

pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                statuses: BTreeMap::new(),
                calls: Vec::new(),
                next_rv: 1,
                conflicts: Conflicts::Never,
                fail_status: false,
            }),
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens inside a failing test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object as if someone else had created it.
    pub fn insert(&self, key: ObjectKey, mut obj: DynamicObject) {
        let mut inner = self.lock();
        stamp_server_fields(&mut obj, &mut inner.next_rv, true);
        inner.objects.insert(key, obj);
    }

    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> { self.lock().objects.get(key).cloned() }

    pub fn keys(&self) -> Vec<ObjectKey> { self.lock().objects.keys().cloned().collect() }

    pub fn status(&self, namespace: &str, name: &str) -> Option<CapsuleStatus> {
        self.lock().statuses.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    /// Fail the next `n` updates with `Conflict`.
    pub fn conflict_next_updates(&self, n: usize) { self.lock().conflicts = Conflicts::Next(n); }

    /// Fail every update with `Conflict`.
    pub fn always_conflict(&self) { self.lock().conflicts = Conflicts::Always; }

    pub fn fail_status_updates(&self, fail: bool) { self.lock().fail_status = fail; }
}

fn stamp_server_fields(obj: &mut DynamicObject, next_rv: &mut u64, fresh: bool) {
    obj.metadata.resource_version = Some(next_rv.to_string());
    *next_rv += 1;
    if fresh {
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        obj.metadata.generation = Some(1);
    } else {
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ClusterError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Get(key.clone()));
        Ok(inner.objects.get(key).cloned())
    }

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, ClusterError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Create { key: key.clone(), dry_run });
        if inner.objects.contains_key(key) {
            return Err(ClusterError::AlreadyExists(format!("{} already exists", key)));
        }
        if obj.metadata.resource_version.is_some() {
            return Err(ClusterError::Api("resourceVersion should not be set on objects to be created".into()));
        }
        let mut created = obj.clone();
        if dry_run {
            return Ok(created);
        }
        let Inner { next_rv, objects, .. } = &mut *inner;
        stamp_server_fields(&mut created, next_rv, true);
        objects.insert(key.clone(), created.clone());
        Ok(created)
    }

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Update(key.clone()));
        match inner.conflicts {
            Conflicts::Always => return Err(ClusterError::Conflict(format!("{} was modified", key))),
            Conflicts::Next(n) if n > 0 => {
                inner.conflicts = Conflicts::Next(n - 1);
                return Err(ClusterError::Conflict(format!("{} was modified", key)));
            }
            _ => {}
        }
        let Inner { next_rv, objects, .. } = &mut *inner;
        let stored = objects.get(key).ok_or_else(|| ClusterError::NotFound(format!("{} not found", key)))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if stored.metadata.resource_version.as_deref() != Some(rv) {
                return Err(ClusterError::Conflict(format!("{} resourceVersion {} is stale", key, rv)));
            }
        }
        let mut updated = obj.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.generation = stored.metadata.generation;
        stamp_server_fields(&mut updated, next_rv, false);
        objects.insert(key.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Delete(key.clone()));
        match inner.objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("{} not found", key))),
        }
    }

    async fn update_status(&self, capsule: &Capsule, status: &CapsuleStatus) -> Result<(), ClusterError> {
        let mut inner = self.lock();
        let namespace = capsule.namespace().unwrap_or_default();
        let name = capsule.name_any();
        inner.calls.push(Call::UpdateStatus { namespace: namespace.clone(), name: name.clone() });
        if inner.fail_status {
            return Err(ClusterError::Api("status update rejected".into()));
        }
        inner.statuses.insert((namespace, name), status.clone());
        Ok(())
    }
}
