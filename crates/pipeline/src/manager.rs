//! Mod discovery and step construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use keel_core::{Error, Mod, Result, Scheme};
use keel_kubehub::ClusterClient;
use keel_plugin::{ModExecutor, ModInfo, ModOptions};

use crate::config::{PipelineConfig, StepConfig};
use crate::matcher::Matcher;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::step::Step;

/// Directory entries carrying this file describe several mods sharing one binary.
pub const MANIFEST_FILE: &str = "manifest.yaml";

/// Turns a registered mod into a running one.
#[async_trait]
pub trait ModLauncher: Send + Sync {
    async fn launch(&self, info: &ModInfo) -> Result<Box<dyn Mod>>;
}

/// Launches every mod as a subprocess.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    opts: ModOptions,
}

impl ProcessLauncher {
    pub fn new(opts: ModOptions) -> Self { Self { opts } }
}

#[async_trait]
impl ModLauncher for ProcessLauncher {
    async fn launch(&self, info: &ModInfo) -> Result<Box<dyn Mod>> {
        let exec = ModExecutor::start(info, self.opts).await?;
        Ok(Box::new(exec))
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    binary: PathBuf,
    #[serde(default)]
    mods: Vec<ManifestMod>,
}

#[derive(Debug, Deserialize)]
struct ManifestMod {
    name: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    image: Option<String>,
}

/// Check a `<group>.<name>` mod name; both halves must be DNS labels.
pub fn validate_mod_name(name: &str) -> Result<()> {
    let label = Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$")
        .map_err(|e| Error::Internal(format!("mod name pattern: {e}")))?;
    match name.split_once('.') {
        Some((group, short)) if label.is_match(group) && label.is_match(short) => Ok(()),
        _ => Err(Error::InvalidArgument(format!(
            "invalid mod name {name:?}: expected <group>.<name> with lowercase DNS labels"
        ))),
    }
}

pub struct Manager {
    mods: BTreeMap<String, ModInfo>,
    launcher: Arc<dyn ModLauncher>,
}

impl Manager {
    pub fn new(launcher: Arc<dyn ModLauncher>) -> Self { Self { mods: BTreeMap::new(), launcher } }

    pub fn with_process_launcher(opts: ModOptions) -> Self { Self::new(Arc::new(ProcessLauncher::new(opts))) }

    /// Add one mod. Names are unique across built-in and discovered mods.
    pub fn register(&mut self, info: ModInfo) -> Result<()> {
        validate_mod_name(&info.name)?;
        if let Some(existing) = self.mods.get(&info.name) {
            return Err(Error::InvalidArgument(format!(
                "mod {} is provided by both {} and {}",
                info.name,
                existing.path.display(),
                info.path.display()
            )));
        }
        debug!(module = %info.name, path = %info.path.display(), "registered mod");
        self.mods.insert(info.name.clone(), info);
        Ok(())
    }

    /// Register built-ins served by re-running `self_path mod <name>`.
    pub fn register_builtins<I, S>(&mut self, self_path: &Path, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref();
            self.register(ModInfo::new(name, self_path).with_args(["mod", name]))?;
        }
        Ok(())
    }

    /// Register every mod found in `dir`.
    ///
    /// A subdirectory with a manifest contributes each mod it lists; any other
    /// non-hidden file is a single mod named after the file.
    pub fn discover_dir(&mut self, dir: &Path) -> Result<usize> {
        let read = std::fs::read_dir(dir)
            .map_err(|e| Error::InvalidArgument(format!("reading mod directory {}: {e}", dir.display())))?;
        let mut entries: Vec<PathBuf> = read.filter_map(|e| e.ok().map(|e| e.path())).collect();
        entries.sort();

        let mut found = 0;
        for path in entries {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                let manifest = path.join(MANIFEST_FILE);
                if !manifest.is_file() {
                    warn!(dir = %path.display(), "skipping mod directory without a manifest");
                    continue;
                }
                for info in read_manifest(&manifest, &path)? {
                    self.register(info)?;
                    found += 1;
                }
            } else {
                self.register(ModInfo::new(file_name, path))?;
                found += 1;
            }
        }
        info!(dir = %dir.display(), mods = found, "discovered mods");
        Ok(found)
    }

    pub fn info(&self, name: &str) -> Option<&ModInfo> { self.mods.get(name) }

    pub fn mods(&self) -> impl Iterator<Item = &ModInfo> { self.mods.values() }

    /// Start and initialize every mod the step names.
    ///
    /// If any mod fails to come up, the ones already started are stopped
    /// before the error is returned.
    pub async fn new_step(&self, cfg: &StepConfig) -> Result<Step> {
        let mut resolved = Vec::with_capacity(cfg.mods.len());
        for r in &cfg.mods {
            let info = self
                .mods
                .get(&r.name)
                .ok_or_else(|| Error::InvalidArgument(format!("mod {} is not registered", r.name)))?;
            resolved.push((r, info));
        }
        let matcher = Matcher::new(&cfg.namespaces, &cfg.capsules, cfg.selector.as_ref(), cfg.enable_for_platform)?;

        let mut started: Vec<Box<dyn Mod>> = Vec::with_capacity(resolved.len());
        for (r, info) in resolved {
            let res = match self.launcher.launch(info).await {
                Ok(mut m) => match m.initialize(&r.config, &r.tag).await {
                    Ok(()) => Ok(m),
                    Err(e) => {
                        m.stop().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            match res {
                Ok(m) => started.push(m),
                Err(e) => {
                    for m in started.iter_mut() {
                        m.stop().await;
                    }
                    return Err(e.context(format!("starting mod {}", info.name)));
                }
            }
        }
        Ok(Step::new(matcher, started))
    }

    /// Build every configured step, tearing down earlier steps on failure.
    pub async fn new_pipeline(
        &self,
        client: Arc<dyn ClusterClient>,
        scheme: Arc<Scheme>,
        cfg: &PipelineConfig,
    ) -> Result<Pipeline> {
        let mut steps = Vec::with_capacity(cfg.steps.len());
        for (i, step_cfg) in cfg.steps.iter().enumerate() {
            match self.new_step(step_cfg).await {
                Ok(step) => steps.push(step),
                Err(e) => {
                    for step in steps.iter_mut() {
                        step.stop().await;
                    }
                    return Err(e.context(format!("step {i}")));
                }
            }
        }
        Ok(Pipeline::new(client, scheme, steps, PipelineOptions::from(cfg)))
    }
}

fn read_manifest(manifest: &Path, dir: &Path) -> Result<Vec<ModInfo>> {
    let text = std::fs::read_to_string(manifest)
        .map_err(|e| Error::InvalidArgument(format!("reading {}: {e}", manifest.display())))?;
    let m: Manifest = serde_yaml::from_str(&text)
        .map_err(|e| Error::InvalidArgument(format!("parsing {}: {e}", manifest.display())))?;
    let binary = if m.binary.is_absolute() { m.binary } else { dir.join(m.binary) };
    Ok(m.mods
        .into_iter()
        .map(|e| ModInfo { name: e.name, path: binary.clone(), args: e.args, image: e.image })
        .collect())
}
