use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::debug;

use keel_core::{Capsule, CapsuleRequest, Mod, Result};

use crate::matcher::Matcher;

/// A matcher plus the mods it runs, in order.
pub struct Step {
    matcher: Matcher,
    mods: Vec<Box<dyn Mod>>,
}

impl Step {
    /// Mods must already be initialized.
    pub fn new(matcher: Matcher, mods: Vec<Box<dyn Mod>>) -> Self { Self { matcher, mods } }

    pub fn mod_names(&self) -> Vec<&str> { self.mods.iter().map(|m| m.name()).collect() }

    pub fn matches(&self, capsule: &Capsule) -> bool {
        let ns = capsule.effective_namespace();
        let empty = BTreeMap::new();
        let labels = capsule.metadata.labels.as_ref().unwrap_or(&empty);
        self.matcher.matches(&ns, &capsule.name_any(), labels)
    }

    /// Run every mod in order, stopping at the first error.
    pub async fn apply(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        for m in self.mods.iter_mut() {
            debug!(capsule = %capsule.name_any(), module = %m.name(), "running mod");
            m.run(capsule, req).await.map_err(|e| e.context(format!("mod {}", m.name())))?;
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        for m in self.mods.iter_mut() {
            m.stop().await;
        }
    }
}
