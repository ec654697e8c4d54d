use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{info, warn};

use keel_core::{Capsule, Error, ResourceState, Result, Scheme};
use keel_kubehub::ClusterClient;

use crate::config::{PipelineConfig, DEFAULT_COMMIT_RETRY_BACKOFF, DEFAULT_MAX_COMMIT_RETRIES};
use crate::request::Request;
use crate::result::PipelineResult;
use crate::status::{error_status, success_status};
use crate::step::Step;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub force_adopt: bool,
    /// Aborted passes retried before giving up.
    pub max_commit_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            force_adopt: false,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            retry_backoff: DEFAULT_COMMIT_RETRY_BACKOFF,
        }
    }
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            force_adopt: c.force_adopt,
            max_commit_retries: c.max_commit_retries,
            retry_backoff: c.commit_retry_backoff,
        }
    }
}

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Compute and preflight the changes without writing anything.
    pub dry_run: bool,
    /// Adopt foreign objects for this call even if the pipeline does not.
    pub force_adopt: bool,
}

/// Runs the configured steps against capsules and commits the outcome.
///
/// Steps sit behind async mutexes so concurrent runs for different capsules
/// can share one set of mod processes; each run owns its `Request`.
pub struct Pipeline {
    client: Arc<dyn ClusterClient>,
    scheme: Arc<Scheme>,
    steps: Vec<Mutex<Step>>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(client: Arc<dyn ClusterClient>, scheme: Arc<Scheme>, steps: Vec<Step>, options: PipelineOptions) -> Self {
        Self { client, scheme, steps: steps.into_iter().map(Mutex::new).collect(), options }
    }

    pub fn options(&self) -> &PipelineOptions { &self.options }

    pub fn step_count(&self) -> usize { self.steps.len() }

    /// Reconcile one capsule.
    ///
    /// On success the capsule status is replaced from the result; on a
    /// terminal error only its error list is updated. Dry runs leave the
    /// status alone.
    pub async fn run_capsule(&self, capsule: &Capsule, run: RunOptions) -> Result<PipelineResult> {
        let t0 = Instant::now();
        let name = capsule.name_any();
        let ns = capsule.effective_namespace();
        counter!("pipeline_runs_total", 1u64);

        let res = self.reconcile(capsule, run).await;
        histogram!("pipeline_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => info!(
                capsule = %name,
                ns = %ns,
                dry_run = run.dry_run,
                attempts = r.attempts,
                created = r.count(ResourceState::Created),
                updated = r.count(ResourceState::Updated),
                deleted = r.count(ResourceState::Deleted),
                took_ms = %t0.elapsed().as_millis(),
                "pipeline: run ok"
            ),
            Err(e) => {
                counter!("pipeline_run_errors_total", 1u64);
                warn!(capsule = %name, ns = %ns, error = %e, "pipeline: run failed");
                if !run.dry_run {
                    if let Err(se) = self.client.update_status(capsule, &error_status(capsule, e)).await {
                        warn!(capsule = %name, ns = %ns, error = %se, "recording pipeline error on status failed");
                    }
                }
            }
        }
        res
    }

    async fn reconcile(&self, capsule: &Capsule, run: RunOptions) -> Result<PipelineResult> {
        let mut req = Request::new(capsule.clone(), self.client.clone(), self.scheme.clone())
            .with_force_adopt(self.options.force_adopt || run.force_adopt);
        req.load_existing().await?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut result = req.prepare();
            for step in &self.steps {
                let mut step = step.lock().await;
                if !step.matches(capsule) {
                    continue;
                }
                step.apply(capsule, &mut req).await?;
            }

            match req.commit(run.dry_run).await {
                Ok(changes) => {
                    result.output_objects = req.outputs(&changes);
                    result.used_resources = req.used_resources().to_vec();
                    result.dry_run = run.dry_run;
                    result.attempts = attempt;
                    if !run.dry_run {
                        self.client
                            .update_status(capsule, &success_status(capsule, &result))
                            .await
                            .map_err(|e| Error::from(e).context("writing capsule status"))?;
                    }
                    return Ok(result);
                }
                Err(e) if e.is_aborted() => {
                    counter!("pipeline_commit_aborted_total", 1u64);
                    if attempt > self.options.max_commit_retries {
                        return Err(e.context(format!("giving up after {attempt} attempts")));
                    }
                    warn!(capsule = %capsule.name_any(), attempt, error = %e, "commit aborted, retrying pass");
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop every mod of every step.
    pub async fn shutdown(&self) {
        for step in &self.steps {
            step.lock().await.stop().await;
        }
    }
}
