#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use keel_core::request::set_typed;
use keel_core::{Capsule, CapsuleRequest, CapsuleSpec, Error, Mod, ResourceRef, Result, UsedResource};
use keel_kubehub::MemoryCluster;
use keel_pipeline::{Manager, ModLauncher};
use keel_plugin::ModInfo;

pub fn capsule(name: &str, ns: &str, labels: &[(&str, &str)]) -> Capsule {
    let mut c = Capsule::new(name, CapsuleSpec::default());
    c.metadata.namespace = Some(ns.into());
    c.metadata.generation = Some(1);
    c.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    c
}

/// Pick up the status the last run wrote, as a watch would.
pub fn refresh(c: &mut Capsule, cluster: &MemoryCluster) {
    c.status = cluster.status(&c.namespace().unwrap_or_default(), &c.name_any());
}

fn app_labels(name: &str) -> BTreeMap<String, String> { BTreeMap::from([("app".to_string(), name.to_string())]) }

/// Sets a Deployment named after the capsule carrying one label from its
/// `key=value` config (default `x=y`).
#[derive(Default)]
pub struct LabelMod {
    label: (String, String),
}

#[async_trait]
impl Mod for LabelMod {
    fn name(&self) -> &str { "test.labels" }

    async fn initialize(&mut self, config: &str, _tag: &str) -> Result<()> {
        let (k, v) = config.split_once('=').unwrap_or(("x", "y"));
        self.label = (k.to_string(), v.to_string());
        Ok(())
    }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        let name = capsule.name_any();
        let dep = Deployment {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([self.label.clone()])),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector { match_labels: Some(app_labels(&name)), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(app_labels(&name)), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "main".into(),
                            image: Some("nginx:1.27".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        set_typed(req, &dep).await
    }
}

/// Sets a ConfigMap and reports a Secret it depends on.
#[derive(Default)]
pub struct ConfigMod;

#[async_trait]
impl Mod for ConfigMod {
    fn name(&self) -> &str { "test.config" }

    async fn initialize(&mut self, _config: &str, _tag: &str) -> Result<()> { Ok(()) }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some(format!("{}-config", capsule.name_any())), ..Default::default() },
            data: Some(BTreeMap::from([("a".to_string(), "b".to_string())])),
            ..Default::default()
        };
        set_typed(req, &cm).await?;
        req.mark_used_resource(UsedResource {
            reference: ResourceRef::new("", "Secret", "db"),
            state: "found".into(),
            message: None,
        })
        .await
    }
}

/// Fails every run, or initialization when configured with `fail-init`.
#[derive(Default)]
pub struct FailingMod;

#[async_trait]
impl Mod for FailingMod {
    fn name(&self) -> &str { "test.failing" }

    async fn initialize(&mut self, config: &str, _tag: &str) -> Result<()> {
        if config == "fail-init" {
            return Err(Error::FailedPrecondition("refusing to start".into()));
        }
        Ok(())
    }

    async fn run(&mut self, _capsule: &Capsule, _req: &mut dyn CapsuleRequest) -> Result<()> {
        Err(Error::InvalidArgument("image is required".into()))
    }
}

/// Writes into a namespace other than the capsule's.
#[derive(Default)]
pub struct StrayMod;

#[async_trait]
impl Mod for StrayMod {
    fn name(&self) -> &str { "test.stray" }

    async fn initialize(&mut self, _config: &str, _tag: &str) -> Result<()> { Ok(()) }

    async fn run(&mut self, _capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("elsewhere".into()), namespace: Some("kube-system".into()), ..Default::default() },
            ..Default::default()
        };
        set_typed(req, &cm).await
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Mod> + Send + Sync>;

/// Launches in-process mods and records their lifecycle.
pub struct FakeLauncher {
    factories: HashMap<String, Factory>,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        let mut factories: HashMap<String, Factory> = HashMap::new();
        factories.insert("test.labels".into(), Box::new(|| Box::new(LabelMod::default())));
        factories.insert("test.config".into(), Box::new(|| Box::new(ConfigMod)));
        factories.insert("test.failing".into(), Box::new(|| Box::new(FailingMod)));
        factories.insert("test.stray".into(), Box::new(|| Box::new(StrayMod)));
        Self { factories, events: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn events(&self) -> Vec<String> { self.events.lock().unwrap().clone() }
}

#[async_trait]
impl ModLauncher for FakeLauncher {
    async fn launch(&self, info: &ModInfo) -> Result<Box<dyn Mod>> {
        if info.path.to_str() == Some("/missing") {
            return Err(Error::Unavailable(format!("starting mod {}: no such file", info.name)));
        }
        let make = self.factories.get(&info.name).ok_or_else(|| Error::NotFound(info.name.clone()))?;
        self.events.lock().unwrap().push(format!("start {}", info.name));
        Ok(Box::new(Recorded { inner: make(), events: self.events.clone() }))
    }
}

struct Recorded {
    inner: Box<dyn Mod>,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Mod for Recorded {
    fn name(&self) -> &str { self.inner.name() }

    async fn initialize(&mut self, config: &str, tag: &str) -> Result<()> { self.inner.initialize(config, tag).await }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        self.inner.run(capsule, req).await
    }

    async fn stop(&mut self) {
        self.events.lock().unwrap().push(format!("stop {}", self.inner.name()));
        self.inner.stop().await;
    }
}

/// A manager whose mods all run in-process.
pub fn manager() -> (Manager, Arc<FakeLauncher>) {
    let launcher = Arc::new(FakeLauncher::new());
    let mut m = Manager::new(launcher.clone());
    for name in launcher.names() {
        m.register(ModInfo::new(name, "/fake/bin")).unwrap();
    }
    (m, launcher)
}
