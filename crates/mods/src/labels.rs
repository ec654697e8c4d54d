use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde::Deserialize;

use keel_core::request::{get_new_typed, set_typed};
use keel_core::{Capsule, CapsuleRequest, Mod, Result};

use crate::parse_config;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
struct Config {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
}

/// Adds configured labels and annotations to the capsule's Deployment and
/// its pod template. Runs after `keel.deployment`.
#[derive(Debug, Default)]
pub struct LabelsMod {
    config: Config,
}

impl LabelsMod {
    pub const NAME: &'static str = "keel.labels";
}

fn merge(into: &mut Option<BTreeMap<String, String>>, from: &BTreeMap<String, String>) {
    if from.is_empty() {
        return;
    }
    let map = into.get_or_insert_with(BTreeMap::new);
    map.extend(from.iter().map(|(k, v)| (k.clone(), v.clone())));
}

#[async_trait]
impl Mod for LabelsMod {
    fn name(&self) -> &str { Self::NAME }

    async fn initialize(&mut self, config: &str, _tag: &str) -> Result<()> {
        self.config = parse_config(Self::NAME, config)?;
        Ok(())
    }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        let Some(mut dep) = get_new_typed::<Deployment>(req, &capsule.name_any()).await? else {
            return Ok(());
        };
        merge(&mut dep.metadata.labels, &self.config.labels);
        merge(&mut dep.metadata.annotations, &self.config.annotations);
        if let Some(meta) = dep.spec.as_mut().and_then(|s| s.template.metadata.as_mut()) {
            merge(&mut meta.labels, &self.config.labels);
            merge(&mut meta.annotations, &self.config.annotations);
        }
        set_typed(req, &dep).await
    }
}
