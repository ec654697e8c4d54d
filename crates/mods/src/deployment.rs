use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, PodSpec, PodTemplateSpec, SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

use keel_core::request::set_typed;
use keel_core::{Capsule, CapsuleRequest, EnvSource, Error, Mod, ResourceRef, Result, UsedResource};

use crate::{app_labels, parse_config};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    service_account_name: Option<String>,
    revision_history_limit: Option<i32>,
}

/// Deployment running the capsule image.
#[derive(Debug, Default)]
pub struct DeploymentMod {
    config: Config,
}

impl DeploymentMod {
    pub const NAME: &'static str = "keel.deployment";
}

fn env_from(src: &EnvSource) -> Result<EnvFromSource> {
    match src.kind.as_str() {
        "ConfigMap" => Ok(EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource { name: Some(src.name.clone()), optional: None }),
            ..Default::default()
        }),
        "Secret" => Ok(EnvFromSource {
            secret_ref: Some(SecretEnvSource { name: Some(src.name.clone()), optional: None }),
            ..Default::default()
        }),
        other => Err(Error::InvalidArgument(format!("envFrom kind must be ConfigMap or Secret, got {other}"))),
    }
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> { if v.is_empty() { None } else { Some(v) } }

#[async_trait]
impl Mod for DeploymentMod {
    fn name(&self) -> &str { Self::NAME }

    async fn initialize(&mut self, config: &str, _tag: &str) -> Result<()> {
        self.config = parse_config(Self::NAME, config)?;
        Ok(())
    }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        let name = capsule.name_any();
        let Some(image) = capsule.spec.image.clone() else {
            debug!(capsule = %name, "no image, skipping deployment");
            return Ok(());
        };
        let spec = &capsule.spec;

        let env = spec.env.iter().map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), value_from: None }).collect();
        let env_from = spec.env_from.iter().map(env_from).collect::<Result<Vec<_>>>()?;
        let ports = spec
            .interfaces
            .iter()
            .map(|i| ContainerPort { name: Some(i.name.clone()), container_port: i.port, ..Default::default() })
            .collect();

        let container = Container {
            name: name.clone(),
            image: Some(image),
            command: non_empty(spec.command.clone()),
            args: non_empty(spec.args.clone()),
            env: non_empty(env),
            env_from: non_empty(env_from),
            ports: non_empty(ports),
            ..Default::default()
        };
        let labels = app_labels(&name);
        let dep = Deployment {
            metadata: ObjectMeta { name: Some(name.clone()), labels: Some(labels.clone()), ..Default::default() },
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas.unwrap_or(1)),
                revision_history_limit: self.config.revision_history_limit,
                selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        service_account_name: self.config.service_account_name.clone(),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        set_typed(req, &dep).await?;

        for src in &spec.env_from {
            req.mark_used_resource(UsedResource {
                reference: ResourceRef::new("", &src.kind, &src.name),
                state: "referenced".into(),
                message: Some(format!("environment source of deployment {name}")),
            })
            .await?;
        }
        Ok(())
    }
}
