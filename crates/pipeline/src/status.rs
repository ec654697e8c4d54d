//! Capsule status derived from a pipeline outcome.

use keel_core::{Capsule, CapsuleStatus, Error, OwnedResource, ResourceRef, ResourceState};

use crate::result::PipelineResult;

/// Status after a successful run: owned and used lists are replaced wholesale.
///
/// Deleted objects drop out unless their deletion failed; adopted objects are
/// recorded so the next run manages them.
pub fn success_status(capsule: &Capsule, result: &PipelineResult) -> CapsuleStatus {
    let owned_resources = result
        .output_objects
        .iter()
        .filter(|o| o.change.state != ResourceState::Deleted || o.change.error.is_some())
        .map(|o| OwnedResource {
            reference: ResourceRef::new(&o.key.gvk.group, &o.key.gvk.kind, &o.key.name),
            state: o.change.observed_state(),
            message: o.change.error.clone(),
        })
        .collect();
    CapsuleStatus {
        observed_generation: capsule.metadata.generation,
        owned_resources,
        used_resources: result.used_resources.clone(),
        errors: Vec::new(),
    }
}

/// Status after a terminal error: only the error list changes.
pub fn error_status(capsule: &Capsule, err: &Error) -> CapsuleStatus {
    let mut status = capsule.status.clone().unwrap_or_default();
    status.errors = vec![err.to_string()];
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::OutputObject;
    use keel_core::{Change, CapsuleSpec, Gvk, ObjectKey};
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    fn output(kind: &str, name: &str, change: Change) -> OutputObject {
        let gvk = Gvk::new("apps", "v1", kind);
        let ar = ApiResource::from_gvk(&GroupVersionKind::from(&gvk));
        OutputObject { key: ObjectKey::new(gvk, "ns", name), object: DynamicObject::new(name, &ar), change }
    }

    #[test]
    fn success_replaces_lists_and_drops_deleted() {
        let mut capsule = Capsule::new("web", CapsuleSpec::default());
        capsule.metadata.generation = Some(4);
        capsule.status = Some(CapsuleStatus { errors: vec!["old".into()], ..Default::default() });
        let result = PipelineResult {
            output_objects: vec![
                output("Deployment", "web", Change::applied(ResourceState::Created)),
                output("Deployment", "old", Change::applied(ResourceState::Deleted)),
                output("Deployment", "stuck", Change::failed(ResourceState::Deleted, "forbidden")),
            ],
            ..Default::default()
        };
        let s = success_status(&capsule, &result);
        assert_eq!(s.observed_generation, Some(4));
        assert!(s.errors.is_empty());
        let names: Vec<_> = s.owned_resources.iter().map(|o| o.reference.name.as_str()).collect();
        assert_eq!(names, vec!["web", "stuck"]);
        assert_eq!(s.owned_resources[1].state, ResourceState::ChangePending);
        assert_eq!(s.owned_resources[1].message.as_deref(), Some("forbidden"));
    }

    #[test]
    fn error_keeps_previous_status() {
        let mut capsule = Capsule::new("web", CapsuleSpec::default());
        capsule.status = Some(CapsuleStatus {
            observed_generation: Some(2),
            owned_resources: vec![OwnedResource {
                reference: ResourceRef::new("apps", "Deployment", "web"),
                state: ResourceState::Created,
                message: None,
            }],
            ..Default::default()
        });
        let s = error_status(&capsule, &Error::InvalidArgument("bad config".into()));
        assert_eq!(s.observed_generation, Some(2));
        assert_eq!(s.owned_resources.len(), 1);
        assert_eq!(s.errors, vec!["invalid argument: bad config".to_string()]);
    }
}
