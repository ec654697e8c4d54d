//! Pipeline configuration: a YAML document overridden by `KEEL_*` env vars.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use tracing::warn;

use keel_core::{Error, Result};

pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 10;
pub const DEFAULT_COMMIT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub force_adopt: bool,
    pub max_commit_retries: u32,
    /// Base delay between aborted passes; grows linearly with the attempt.
    #[serde(rename = "commitRetryBackoffMs", with = "millis")]
    pub commit_retry_backoff: Duration,
    pub mod_dir: Option<PathBuf>,
    pub steps: Vec<StepConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            force_adopt: false,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            commit_retry_backoff: DEFAULT_COMMIT_RETRY_BACKOFF,
            mod_dir: None,
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepConfig {
    pub namespaces: Vec<String>,
    pub capsules: Vec<String>,
    pub selector: Option<LabelSelector>,
    pub enable_for_platform: bool,
    pub mods: Vec<ModRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModRef {
    pub name: String,
    pub tag: String,
    /// Passed verbatim to the mod's `initialize`.
    pub config: String,
}

impl ModRef {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> { s.serialize_u64(d.as_millis() as u64) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::InvalidArgument(format!("parsing pipeline config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidArgument(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Load from `path` (or `KEEL_CONFIG`), then apply env overrides.
    /// Without any file the defaults apply and there are no steps.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os("KEEL_CONFIG").map(PathBuf::from);
        let mut cfg = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) { self.apply_overrides(|k| std::env::var(k).ok()) }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = get("KEEL_MOD_DIR").filter(|s| !s.is_empty()) {
            self.mod_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = get("KEEL_FORCE_ADOPT") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.force_adopt = true,
                "0" | "false" | "no" | "" => self.force_adopt = false,
                other => warn!(value = %other, "ignoring invalid KEEL_FORCE_ADOPT"),
            }
        }
        if let Some(v) = get("KEEL_MAX_COMMIT_RETRIES") {
            match v.trim().parse::<u32>() {
                Ok(n) => self.max_commit_retries = n,
                Err(_) => warn!(value = %v, "ignoring invalid KEEL_MAX_COMMIT_RETRIES"),
            }
        }
        if let Some(v) = get("KEEL_COMMIT_RETRY_BACKOFF_MS") {
            match v.trim().parse::<u64>() {
                Ok(ms) => self.commit_retry_backoff = Duration::from_millis(ms),
                Err(_) => warn!(value = %v, "ignoring invalid KEEL_COMMIT_RETRY_BACKOFF_MS"),
            }
        }
    }
}
