use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde::Deserialize;

use keel_core::request::set_typed;
use keel_core::{Capsule, CapsuleRequest, Error, Mod, Result};

use crate::{app_labels, parse_config};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    /// `ClusterIP` (default), `NodePort` or `LoadBalancer`.
    #[serde(rename = "type")]
    service_type: Option<String>,
}

/// Service exposing the capsule's interfaces.
#[derive(Debug, Default)]
pub struct ServiceMod {
    config: Config,
}

impl ServiceMod {
    pub const NAME: &'static str = "keel.service";
}

#[async_trait]
impl Mod for ServiceMod {
    fn name(&self) -> &str { Self::NAME }

    async fn initialize(&mut self, config: &str, _tag: &str) -> Result<()> {
        let cfg: Config = parse_config(Self::NAME, config)?;
        if let Some(t) = cfg.service_type.as_deref() {
            if !matches!(t, "ClusterIP" | "NodePort" | "LoadBalancer") {
                return Err(Error::InvalidArgument(format!("{}: unsupported service type {t}", Self::NAME)));
            }
        }
        self.config = cfg;
        Ok(())
    }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        if capsule.spec.interfaces.is_empty() {
            return Ok(());
        }
        let name = capsule.name_any();
        let ports = capsule
            .spec
            .interfaces
            .iter()
            .map(|i| ServicePort {
                name: Some(i.name.clone()),
                port: i.port,
                target_port: Some(IntOrString::String(i.name.clone())),
                ..Default::default()
            })
            .collect();
        let svc = Service {
            metadata: ObjectMeta { name: Some(name.clone()), labels: Some(app_labels(&name)), ..Default::default() },
            spec: Some(ServiceSpec {
                selector: Some(app_labels(&name)),
                ports: Some(ports),
                type_: self.config.service_type.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_typed(req, &svc).await
    }
}
