//! Step applicability.

use std::collections::BTreeMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use keel_core::{Error, Result};

/// Capsule that carries platform-wide objects; steps skip it unless opted in.
pub const PLATFORM_CAPSULE_NAME: &str = "keel-platform";

/// Decides whether a step runs for a capsule.
///
/// Empty namespace or capsule pattern lists match everything.
#[derive(Debug, Clone)]
pub struct Matcher {
    namespaces: Option<GlobSet>,
    capsules: Option<GlobSet>,
    selector: Vec<Requirement>,
    enable_for_platform: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|v| vs.contains(v)),
            Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |v| !vs.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

fn glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let glob = Glob::new(p).map_err(|e| Error::InvalidArgument(format!("invalid pattern {p:?}: {e}")))?;
        b.add(glob);
    }
    b.build().map(Some).map_err(|e| Error::InvalidArgument(format!("building pattern set: {e}")))
}

fn requirement(expr: &LabelSelectorRequirement) -> Result<Requirement> {
    let values = expr.values.clone().unwrap_or_default();
    let key = expr.key.clone();
    match expr.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => {
            Err(Error::InvalidArgument(format!("selector operator {} on {key} needs values", expr.operator)))
        }
        "In" => Ok(Requirement::In(key, values)),
        "NotIn" => Ok(Requirement::NotIn(key, values)),
        "Exists" | "DoesNotExist" if !values.is_empty() => {
            Err(Error::InvalidArgument(format!("selector operator {} on {key} takes no values", expr.operator)))
        }
        "Exists" => Ok(Requirement::Exists(key)),
        "DoesNotExist" => Ok(Requirement::DoesNotExist(key)),
        other => Err(Error::InvalidArgument(format!("unknown selector operator {other:?}"))),
    }
}

impl Matcher {
    pub fn new(
        namespaces: &[String],
        capsules: &[String],
        selector: Option<&LabelSelector>,
        enable_for_platform: bool,
    ) -> Result<Self> {
        let mut reqs = Vec::new();
        if let Some(sel) = selector {
            for (k, v) in sel.match_labels.iter().flatten() {
                reqs.push(Requirement::Equals(k.clone(), v.clone()));
            }
            for expr in sel.match_expressions.iter().flatten() {
                reqs.push(requirement(expr)?);
            }
        }
        Ok(Self {
            namespaces: glob_set(namespaces)?,
            capsules: glob_set(capsules)?,
            selector: reqs,
            enable_for_platform,
        })
    }

    /// A matcher that accepts every capsule except the platform one.
    pub fn any() -> Self { Self { namespaces: None, capsules: None, selector: Vec::new(), enable_for_platform: false } }

    pub fn matches(&self, namespace: &str, capsule: &str, labels: &BTreeMap<String, String>) -> bool {
        if capsule == PLATFORM_CAPSULE_NAME && !self.enable_for_platform {
            return false;
        }
        if !self.selector.iter().all(|r| r.matches(labels)) {
            return false;
        }
        let hit = |set: &Option<GlobSet>, s: &str| set.as_ref().map_or(true, |g| g.is_match(s));
        hit(&self.namespaces, namespace) && hit(&self.capsules, capsule)
    }
}
