mod common;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::DynamicObject;

use keel_core::{Error, Gvk, ObjectKey, ResourceState, Scheme, OWNED_BY_LABEL};
use keel_kubehub::memory::Call;
use keel_kubehub::{ClusterClient, MemoryCluster};
use keel_pipeline::{ModRef, Pipeline, PipelineOptions, Request, RunOptions, StepConfig};

use common::{capsule, manager, refresh};

fn deployment_key(ns: &str, name: &str) -> ObjectKey { ObjectKey::new(Gvk::new("apps", "v1", "Deployment"), ns, name) }

fn config_map_key(ns: &str, name: &str) -> ObjectKey { ObjectKey::new(Gvk::new("", "v1", "ConfigMap"), ns, name) }

fn step(mods: &[(&str, &str)]) -> StepConfig {
    StepConfig {
        mods: mods.iter().map(|(name, config)| ModRef { name: name.to_string(), tag: String::new(), config: config.to_string() }).collect(),
        ..Default::default()
    }
}

fn quick_retries(max: u32) -> PipelineOptions {
    PipelineOptions { max_commit_retries: max, retry_backoff: Duration::from_millis(1), ..Default::default() }
}

async fn pipeline(cluster: &Arc<MemoryCluster>, steps: Vec<StepConfig>, options: PipelineOptions) -> Pipeline {
    let (m, _) = manager();
    let mut built = Vec::new();
    for s in &steps {
        built.push(m.new_step(s).await.unwrap());
    }
    Pipeline::new(cluster.clone(), Arc::new(Scheme::with_defaults()), built, options)
}

#[tokio::test]
async fn frontend_capsule_is_created_then_unchanged() {
    let cluster = Arc::new(MemoryCluster::new());
    let selector = LabelSelector {
        match_labels: Some([("tier".to_string(), "frontend".to_string())].into_iter().collect()),
        ..Default::default()
    };
    let cfg = StepConfig { namespaces: vec!["def*".into()], selector: Some(selector), ..step(&[("test.labels", "x=y")]) };
    let p = pipeline(&cluster, vec![cfg], PipelineOptions::default()).await;
    let mut web = capsule("web", "default", &[("tier", "frontend")]);

    let first = p.run_capsule(&web, RunOptions::default()).await.unwrap();
    assert_eq!(first.output_objects.len(), 1);
    assert_eq!(first.output_objects[0].key, deployment_key("default", "web"));
    assert_eq!(first.output_objects[0].state(), ResourceState::Created);
    assert_eq!(first.attempts, 1);

    let stored = cluster.object(&deployment_key("default", "web")).unwrap();
    let labels = stored.metadata.labels.unwrap();
    assert_eq!(labels["x"], "y");
    assert_eq!(labels[OWNED_BY_LABEL], "web");

    refresh(&mut web, &cluster);
    let second = p.run_capsule(&web, RunOptions::default()).await.unwrap();
    assert_eq!(second.output_objects.len(), 1);
    assert_eq!(second.output_objects[0].state(), ResourceState::Unchanged);
    assert_eq!(second.input_objects.len(), 1);
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let cluster = Arc::new(MemoryCluster::new());
    let p = pipeline(&cluster, vec![step(&[("test.labels", ""), ("test.config", "")])], PipelineOptions::default()).await;
    let mut web = capsule("web", "default", &[]);

    p.run_capsule(&web, RunOptions::default()).await.unwrap();
    refresh(&mut web, &cluster);
    let a = p.run_capsule(&web, RunOptions::default()).await.unwrap();
    refresh(&mut web, &cluster);
    let b = p.run_capsule(&web, RunOptions::default()).await.unwrap();

    let summary = |r: &keel_pipeline::PipelineResult| -> Vec<(ObjectKey, ResourceState)> {
        r.output_objects.iter().map(|o| (o.key.clone(), o.state())).collect()
    };
    assert_eq!(summary(&a), summary(&b));
    assert!(a.output_objects.iter().all(|o| o.state() == ResourceState::Unchanged));
    assert_eq!(a.used_resources, b.used_resources);
}

#[tokio::test]
async fn passes_are_deterministic() {
    let cluster: Arc<MemoryCluster> = Arc::new(MemoryCluster::new());
    let (m, _) = manager();
    let mut s = m.new_step(&step(&[("test.labels", ""), ("test.config", "")])).await.unwrap();
    let web = capsule("web", "default", &[]);
    let mut req = Request::new(web.clone(), cluster.clone(), Arc::new(Scheme::with_defaults()));
    req.load_existing().await.unwrap();

    let snapshot = |req: &Request| -> Vec<(ObjectKey, String)> {
        req.objects()
            .iter()
            .filter_map(|(k, m)| m.desired.as_ref().map(|d| (k.clone(), serde_json::to_string(d).unwrap())))
            .collect()
    };
    req.prepare();
    s.apply(&web, &mut req).await.unwrap();
    let first = snapshot(&req);
    req.prepare();
    assert!(snapshot(&req).is_empty());
    s.apply(&web, &mut req).await.unwrap();
    assert_eq!(first, snapshot(&req));
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn objects_no_step_produces_are_deleted() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut web = capsule("web", "default", &[]);
    let both = pipeline(&cluster, vec![step(&[("test.labels", ""), ("test.config", "")])], PipelineOptions::default()).await;
    both.run_capsule(&web, RunOptions::default()).await.unwrap();
    assert!(cluster.object(&config_map_key("default", "web-config")).is_some());

    refresh(&mut web, &cluster);
    let only_labels = pipeline(&cluster, vec![step(&[("test.labels", "")])], PipelineOptions::default()).await;
    let res = only_labels.run_capsule(&web, RunOptions::default()).await.unwrap();
    assert_eq!(res.output(&config_map_key("default", "web-config")).unwrap().state(), ResourceState::Deleted);
    assert_eq!(res.output(&deployment_key("default", "web")).unwrap().state(), ResourceState::Unchanged);
    assert!(cluster.object(&config_map_key("default", "web-config")).is_none());

    let status = cluster.status("default", "web").unwrap();
    let owned: Vec<_> = status.owned_resources.iter().map(|o| o.reference.kind.as_str()).collect();
    assert_eq!(owned, vec!["Deployment"]);
    assert!(status.used_resources.is_empty());
}

fn foreign_deployment() -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "default", "labels": { "owner": "someone-else" } },
        "spec": { "replicas": 5 }
    }))
    .unwrap()
}

#[tokio::test]
async fn foreign_object_aborts_without_force_adopt() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(deployment_key("default", "web"), foreign_deployment());
    let p = pipeline(&cluster, vec![step(&[("test.labels", "")])], quick_retries(2)).await;
    let web = capsule("web", "default", &[]);

    let err = p.run_capsule(&web, RunOptions::default()).await.unwrap_err();
    assert!(err.is_aborted(), "{err:?}");
    let stored = cluster.object(&deployment_key("default", "web")).unwrap();
    assert_eq!(stored.metadata.labels.unwrap()["owner"], "someone-else");
    assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Create { dry_run: false, .. } | Call::Update(_))));
    let status = cluster.status("default", "web").unwrap();
    assert_eq!(status.errors.len(), 1);
    assert!(status.owned_resources.is_empty());
}

#[tokio::test]
async fn force_adopt_reports_already_exists() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(deployment_key("default", "web"), foreign_deployment());
    let p = pipeline(&cluster, vec![step(&[("test.labels", "")])], PipelineOptions::default()).await;
    let web = capsule("web", "default", &[]);

    let res = p.run_capsule(&web, RunOptions { force_adopt: true, ..Default::default() }).await.unwrap();
    assert_eq!(res.output_objects[0].state(), ResourceState::AlreadyExists);
    let stored = cluster.object(&deployment_key("default", "web")).unwrap();
    assert_eq!(stored.data["spec"]["replicas"], 5);
    let status = cluster.status("default", "web").unwrap();
    assert_eq!(status.owned_resources[0].state, ResourceState::AlreadyExists);
}

#[tokio::test]
async fn transient_conflict_retries_the_pass() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut web = capsule("web", "default", &[]);
    pipeline(&cluster, vec![step(&[("test.labels", "x=y")])], PipelineOptions::default())
        .await
        .run_capsule(&web, RunOptions::default())
        .await
        .unwrap();
    refresh(&mut web, &cluster);

    cluster.conflict_next_updates(1);
    let p = pipeline(&cluster, vec![step(&[("test.labels", "x=z")])], quick_retries(3)).await;
    let res = p.run_capsule(&web, RunOptions::default()).await.unwrap();
    assert_eq!(res.attempts, 2);
    assert_eq!(res.output_objects[0].state(), ResourceState::Updated);
    let labels = cluster.object(&deployment_key("default", "web")).unwrap().metadata.labels.unwrap();
    assert_eq!(labels["x"], "z");
}

#[tokio::test]
async fn persistent_conflict_terminates() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut web = capsule("web", "default", &[]);
    pipeline(&cluster, vec![step(&[("test.labels", "x=y")])], PipelineOptions::default())
        .await
        .run_capsule(&web, RunOptions::default())
        .await
        .unwrap();
    refresh(&mut web, &cluster);

    cluster.always_conflict();
    cluster.clear_calls();
    let p = pipeline(&cluster, vec![step(&[("test.labels", "x=z")])], quick_retries(4)).await;
    let err = p.run_capsule(&web, RunOptions::default()).await.unwrap_err();
    assert!(err.is_aborted());
    let updates = cluster.calls().iter().filter(|c| matches!(c, Call::Update(_))).count();
    assert_eq!(updates, 5);
    let status = cluster.status("default", "web").unwrap();
    assert_eq!(status.owned_resources.len(), 1, "previous owned list is kept");
    assert_eq!(status.errors.len(), 1);
}

#[tokio::test]
async fn objects_left_by_an_abandoned_run_are_reclaimed() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut web = capsule("web", "default", &[]);
    pipeline(&cluster, vec![step(&[("test.labels", "")])], PipelineOptions::default())
        .await
        .run_capsule(&web, RunOptions::default())
        .await
        .unwrap();
    refresh(&mut web, &cluster);

    cluster.always_conflict();
    let grown = vec![step(&[("test.labels", "x=z"), ("test.config", "")])];
    let err = pipeline(&cluster, grown.clone(), quick_retries(2)).await.run_capsule(&web, RunOptions::default()).await.unwrap_err();
    assert!(err.is_aborted(), "{err:?}");
    assert!(cluster.object(&config_map_key("default", "web-config")).is_some());
    refresh(&mut web, &cluster);
    let owned: Vec<_> = web.status.as_ref().unwrap().owned_resources.iter().map(|o| o.reference.kind.as_str()).collect();
    assert_eq!(owned, vec!["Deployment"]);

    cluster.conflict_next_updates(0);
    let res = pipeline(&cluster, grown, quick_retries(2)).await.run_capsule(&web, RunOptions::default()).await.unwrap();
    let state = |key: &ObjectKey| res.output_objects.iter().find(|o| &o.key == key).map(|o| o.state());
    assert_eq!(state(&config_map_key("default", "web-config")), Some(ResourceState::Unchanged));
    assert_eq!(state(&deployment_key("default", "web")), Some(ResourceState::Updated));
    let status = cluster.status("default", "web").unwrap();
    assert_eq!(status.owned_resources.len(), 2);
    assert!(status.errors.is_empty(), "{:?}", status.errors);
}

#[tokio::test]
async fn object_labeled_for_another_capsule_still_aborts() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut other = foreign_deployment();
    other.metadata.labels.get_or_insert_with(Default::default).insert(OWNED_BY_LABEL.to_string(), "api".to_string());
    cluster.insert(deployment_key("default", "web"), other);
    let p = pipeline(&cluster, vec![step(&[("test.labels", "")])], quick_retries(2)).await;

    let err = p.run_capsule(&capsule("web", "default", &[]), RunOptions::default()).await.unwrap_err();
    assert!(err.is_aborted(), "{err:?}");
    assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Update(_))));
}

#[tokio::test]
async fn step_error_is_terminal_and_recorded() {
    let cluster = Arc::new(MemoryCluster::new());
    let p = pipeline(&cluster, vec![step(&[("test.labels", ""), ("test.failing", "")])], PipelineOptions::default()).await;
    let web = capsule("web", "default", &[]);

    let err = p.run_capsule(&web, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
    assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Create { .. })));
    let status = cluster.status("default", "web").unwrap();
    assert!(status.errors[0].contains("image is required"), "{:?}", status.errors);
}

#[tokio::test]
async fn objects_outside_the_capsule_namespace_are_rejected() {
    let cluster = Arc::new(MemoryCluster::new());
    let p = pipeline(&cluster, vec![step(&[("test.stray", "")])], PipelineOptions::default()).await;
    let err = p.run_capsule(&capsule("web", "default", &[]), RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    let p = pipeline(&cluster, vec![step(&[("test.labels", ""), ("test.config", "")])], PipelineOptions::default()).await;
    let res = p.run_capsule(&capsule("web", "default", &[]), RunOptions { dry_run: true, ..Default::default() }).await.unwrap();

    assert!(res.dry_run);
    assert_eq!(res.count(ResourceState::Created), 2);
    assert!(res.output_objects.iter().all(|o| !o.change.applied));
    assert!(cluster.keys().is_empty());
    assert!(cluster.status("default", "web").is_none());
    assert!(cluster.calls().iter().all(|c| matches!(c, Call::Create { dry_run: true, .. })));
}

#[tokio::test]
async fn dry_run_reports_unchanged_objects_as_planned() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut web = capsule("web", "default", &[]);
    let p = pipeline(&cluster, vec![step(&[("test.labels", "")])], PipelineOptions::default()).await;
    p.run_capsule(&web, RunOptions::default()).await.unwrap();
    refresh(&mut web, &cluster);

    let res = p.run_capsule(&web, RunOptions { dry_run: true, ..Default::default() }).await.unwrap();
    assert_eq!(res.count(ResourceState::Unchanged), 1);
    assert!(!res.output_objects[0].change.applied);
}

#[tokio::test]
async fn non_matching_steps_are_skipped() {
    let cluster = Arc::new(MemoryCluster::new());
    let cfg = StepConfig { capsules: vec!["api-*".into()], ..step(&[("test.labels", "")]) };
    let p = pipeline(&cluster, vec![cfg], PipelineOptions::default()).await;
    let res = p.run_capsule(&capsule("web", "default", &[]), RunOptions::default()).await.unwrap();
    assert!(res.output_objects.is_empty());
    assert!(cluster.keys().is_empty());
}

#[tokio::test]
async fn used_resources_land_in_status() {
    let cluster = Arc::new(MemoryCluster::new());
    let p = pipeline(&cluster, vec![step(&[("test.config", "")])], PipelineOptions::default()).await;
    p.run_capsule(&capsule("web", "default", &[]), RunOptions::default()).await.unwrap();
    let status = cluster.status("default", "web").unwrap();
    assert_eq!(status.used_resources.len(), 1);
    assert_eq!(status.used_resources[0].reference.name, "db");
    assert_eq!(status.observed_generation, Some(1));
}

#[tokio::test]
async fn missing_owned_objects_are_dropped_on_load() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut web = capsule("web", "default", &[]);
    pipeline(&cluster, vec![step(&[("test.config", "")])], PipelineOptions::default())
        .await
        .run_capsule(&web, RunOptions::default())
        .await
        .unwrap();
    refresh(&mut web, &cluster);
    cluster.delete(&config_map_key("default", "web-config")).await.unwrap();

    let mut req = Request::new(web, cluster.clone(), Arc::new(Scheme::with_defaults()));
    req.load_existing().await.unwrap();
    assert!(req.objects().is_empty());
}
