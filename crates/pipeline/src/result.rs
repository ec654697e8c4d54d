use kube::core::DynamicObject;
use serde::Serialize;

use keel_core::{Change, ObjectKey, ResourceState, UsedResource};

#[derive(Debug, Clone, Serialize)]
pub struct InputObject {
    pub key: ObjectKey,
    pub object: DynamicObject,
}

/// One committed key: the object it ended up as and what happened to it.
#[derive(Debug, Clone, Serialize)]
pub struct OutputObject {
    pub key: ObjectKey,
    pub object: DynamicObject,
    #[serde(flatten)]
    pub change: Change,
}

impl OutputObject {
    pub fn state(&self) -> ResourceState { self.change.state }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Owned objects as loaded before the first step ran.
    pub input_objects: Vec<InputObject>,
    /// Every key the commit considered, in key order.
    pub output_objects: Vec<OutputObject>,
    pub used_resources: Vec<UsedResource>,
    pub dry_run: bool,
    /// Passes it took, counting the final one.
    pub attempts: u32,
}

impl PipelineResult {
    pub fn output(&self, key: &ObjectKey) -> Option<&OutputObject> { self.output_objects.iter().find(|o| &o.key == key) }

    /// Objects that exist (or would exist) after the run.
    pub fn raw_objects(&self) -> Vec<&DynamicObject> {
        self.output_objects.iter().filter(|o| o.change.state != ResourceState::Deleted).map(|o| &o.object).collect()
    }

    pub fn count(&self, state: ResourceState) -> usize {
        self.output_objects.iter().filter(|o| o.change.state == state).count()
    }

    pub fn has_errors(&self) -> bool { self.output_objects.iter().any(|o| o.change.error.is_some()) }
}
