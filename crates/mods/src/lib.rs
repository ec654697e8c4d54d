//! Built-in mods.
//!
//! The host binary serves each of these over the mod protocol when re-run as
//! `keel mod <name>`; they can also be driven in-process.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use keel_core::{Error, Mod, Result};

mod cronjob;
mod deployment;
mod labels;
mod service;

pub use cronjob::CronJobMod;
pub use deployment::DeploymentMod;
pub use labels::LabelsMod;
pub use service::ServiceMod;

pub const BUILTIN_MODS: &[&str] = &[DeploymentMod::NAME, ServiceMod::NAME, CronJobMod::NAME, LabelsMod::NAME];

pub fn new_builtin(name: &str) -> Option<Box<dyn Mod>> {
    match name {
        DeploymentMod::NAME => Some(Box::<DeploymentMod>::default()),
        ServiceMod::NAME => Some(Box::<ServiceMod>::default()),
        CronJobMod::NAME => Some(Box::<CronJobMod>::default()),
        LabelsMod::NAME => Some(Box::<LabelsMod>::default()),
        _ => None,
    }
}

/// Parse a mod's YAML config; empty text means defaults.
pub(crate) fn parse_config<T: DeserializeOwned + Default>(module: &str, config: &str) -> Result<T> {
    if config.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(config).map_err(|e| Error::InvalidArgument(format!("{module} config: {e}")))
}

/// Selector labels tying a capsule's workloads to its pods.
pub(crate) fn app_labels(capsule: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app.kubernetes.io/name".to_string(), capsule.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_can_be_built_and_names_itself() {
        for name in BUILTIN_MODS {
            let m = new_builtin(name).unwrap();
            assert_eq!(m.name(), *name);
        }
        assert!(new_builtin("keel.nope").is_none());
    }

    #[test]
    fn empty_config_means_defaults() {
        #[derive(Debug, Default, PartialEq, serde::Deserialize)]
        struct Cfg {
            #[serde(default)]
            n: u32,
        }
        assert_eq!(parse_config::<Cfg>("x", "  \n").unwrap(), Cfg::default());
        assert_eq!(parse_config::<Cfg>("x", "n: 3").unwrap(), Cfg { n: 3 });
        assert!(parse_config::<Cfg>("x", "n: [").is_err());
    }
}
