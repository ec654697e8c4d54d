//! Deciding whether a desired object differs from what the cluster holds.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde_json::Value as Json;

use keel_core::Compare;

/// Drop server-populated fields so two renditions of the same object compare equal.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// True when every field present in `desired` has the same value in `current`.
///
/// Arrays must have equal length and match element-wise, so removing a list
/// item is a change while server-added map keys are not.
pub fn is_subset(desired: &Json, current: &Json) -> bool {
    match (desired, current) {
        (Json::Object(d), Json::Object(c)) => {
            d.iter().all(|(k, dv)| match c.get(k) {
                Some(cv) => is_subset(dv, cv),
                None => dv.is_null(),
            })
        }
        (Json::Array(d), Json::Array(c)) => d.len() == c.len() && d.iter().zip(c).all(|(dv, cv)| is_subset(dv, cv)),
        (d, c) => d == c,
    }
}

fn labels(obj: &DynamicObject) -> BTreeMap<String, String> { obj.metadata.labels.clone().unwrap_or_default() }

/// Whether `desired` would leave `current` as it is under `policy`.
pub fn objects_equal(policy: Compare, current: &DynamicObject, desired: &DynamicObject) -> bool {
    match policy {
        Compare::Spec => {
            if labels(current) != labels(desired) {
                return false;
            }
            let cur_ann = current.metadata.annotations.clone().unwrap_or_default();
            let want_ann = desired.metadata.annotations.clone().unwrap_or_default();
            if want_ann.iter().any(|(k, v)| cur_ann.get(k) != Some(v)) {
                return false;
            }
            let empty = Json::Null;
            let want = desired.data.get("spec").unwrap_or(&empty);
            let have = current.data.get("spec").unwrap_or(&empty);
            is_subset(want, have)
        }
        Compare::Full => match (serde_json::to_value(current), serde_json::to_value(desired)) {
            (Ok(c), Ok(d)) => strip_noisy(c) == strip_noisy(d),
            _ => false,
        },
    }
}
