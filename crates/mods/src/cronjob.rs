use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec as K8sCronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::Deserialize;

use keel_core::request::set_typed;
use keel_core::{Capsule, CapsuleRequest, Error, Mod, Result};

use crate::{app_labels, parse_config};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    /// `Allow`, `Forbid` or `Replace`.
    concurrency_policy: Option<String>,
    backoff_limit: Option<i32>,
}

/// One CronJob per capsule cron job, running the capsule image.
#[derive(Debug, Default)]
pub struct CronJobMod {
    config: Config,
}

impl CronJobMod {
    pub const NAME: &'static str = "keel.cronjob";
}

#[async_trait]
impl Mod for CronJobMod {
    fn name(&self) -> &str { Self::NAME }

    async fn initialize(&mut self, config: &str, _tag: &str) -> Result<()> {
        self.config = parse_config(Self::NAME, config)?;
        Ok(())
    }

    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        if capsule.spec.cron_jobs.is_empty() {
            return Ok(());
        }
        let name = capsule.name_any();
        let image = capsule
            .spec
            .image
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("capsule {name} has cron jobs but no image")))?;

        for job in &capsule.spec.cron_jobs {
            let container = Container {
                name: job.name.clone(),
                image: Some(image.clone()),
                args: if job.args.is_empty() { None } else { Some(job.args.clone()) },
                ..Default::default()
            };
            let cron = CronJob {
                metadata: ObjectMeta {
                    name: Some(format!("{name}-{}", job.name)),
                    labels: Some(app_labels(&name)),
                    ..Default::default()
                },
                spec: Some(K8sCronJobSpec {
                    schedule: job.schedule.clone(),
                    concurrency_policy: self.config.concurrency_policy.clone(),
                    job_template: JobTemplateSpec {
                        metadata: None,
                        spec: Some(JobSpec {
                            backoff_limit: self.config.backoff_limit,
                            template: PodTemplateSpec {
                                metadata: Some(ObjectMeta { labels: Some(app_labels(&name)), ..Default::default() }),
                                spec: Some(PodSpec {
                                    containers: vec![container],
                                    restart_policy: Some("Never".into()),
                                    ..Default::default()
                                }),
                            },
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            };
            set_typed(req, &cron).await?;
        }
        Ok(())
    }
}
