//! Controller loop that triggers the pipeline for every capsule change.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use keel_core::{Capsule, Error};
use keel_pipeline::{Pipeline, RunOptions};

const REQUEUE_OK: Duration = Duration::from_secs(300);
const REQUEUE_ERR: Duration = Duration::from_secs(15);

async fn reconcile(capsule: Arc<Capsule>, pipeline: Arc<Pipeline>) -> Result<Action, Error> {
    pipeline.run_capsule(&capsule, RunOptions::default()).await?;
    Ok(Action::requeue(REQUEUE_OK))
}

fn error_policy(capsule: Arc<Capsule>, err: &Error, _pipeline: Arc<Pipeline>) -> Action {
    warn!(capsule = %capsule.name_any(), ns = ?capsule.namespace(), error = %err, "reconcile failed; requeueing");
    Action::requeue(REQUEUE_ERR)
}

/// Run until Ctrl-C or SIGTERM.
pub async fn run(client: Client, pipeline: Arc<Pipeline>) {
    let capsules: Api<Capsule> = Api::all(client);
    info!(steps = pipeline.step_count(), "operator starting");
    Controller::new(capsules, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, pipeline)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(capsule = %obj.name, ns = ?obj.namespace, "reconciled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;
}
