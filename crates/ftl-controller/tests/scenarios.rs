//! End-to-end controller behaviour against an in-memory store.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ftl_admin::{AdminService, ValueRef};
use ftl_controller::{ControllerService, CreateDeployment, Heartbeat};
use ftl_core::{Code, ControllerConfig, DeploymentKey, ErrorCode, ManualClock, RunnerKey};
use ftl_routing::RouteTable;
use ftl_scheduler::{Scheduler, SchedulerOptions, StoreLeaser};
use ftl_state::{ClusterEvent, ClusterState, StateStore};
use ftl_timeline::{InMemoryTimeline, TimelineClient};
use futures_util::{StreamExt, stream};
use serde_json::json;
use tokio::sync::watch;

struct Controller {
    service: ControllerService,
    clock: Arc<ManualClock>,
    store: StateStore,
    shutdown: watch::Sender<bool>,
}

fn controller() -> Controller {
    let store = StateStore::open_in_memory().unwrap();
    let state = ClusterState::open(store.clone()).unwrap();
    let (shutdown, rx) = watch::channel(false);
    let (timeline, _) = TimelineClient::spawn(Arc::new(InMemoryTimeline::new()), rx);
    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
    let service = ControllerService::new(
        Arc::new(ControllerConfig::default()),
        state.clone(),
        RouteTable::new(state),
        timeline,
        AdminService::new(store.clone()),
        clock.clone(),
    )
    .unwrap();
    Controller {
        service,
        clock,
        store,
        shutdown,
    }
}

fn deploy_echo(service: &ControllerService) -> DeploymentKey {
    service
        .create_deployment(CreateDeployment {
            schema: "module echo {\n  export verb echo(Unit) String\n}\n".to_string(),
            language: "go".to_string(),
            artefacts: Vec::new(),
        })
        .unwrap()
}

/// Register a runner whose heartbeat stream stays open after one beat.
fn keep_registered(service: &ControllerService, runner: &RunnerKey, deployment: &DeploymentKey) {
    let beat = Heartbeat {
        key: runner.to_string(),
        endpoint: "http://10.0.0.7:8894".to_string(),
        deployment: deployment.to_string(),
    };
    let heartbeats = stream::iter([Ok::<_, Infallible>(beat)]).chain(stream::pending());
    let service = service.clone();
    tokio::spawn(async move { service.register_runner(heartbeats).await });
}

async fn wait_for_runner(service: &ControllerService) {
    for _ in 0..100 {
        if !service.state().view().runners.is_empty() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("runner never registered");
}

#[tokio::test]
async fn deployment_activation_makes_the_module_routable() {
    let c = controller();
    let key = deploy_echo(&c.service);
    assert!(key.to_string().starts_with("dpl-echo-"));

    let status = c.service.status();
    assert_eq!(status.deployments.len(), 1);
    assert_eq!(status.deployments[0].min_replicas, 0);

    c.service.update_deploy(&key, Some(1)).unwrap();
    assert_eq!(c.service.status().deployments[0].min_replicas, 1);
    assert!(c.service.routes().get_for_module("echo").is_none());

    keep_registered(&c.service, &RunnerKey::new("10.0.0.7", 8894), &key);
    wait_for_runner(&c.service).await;
    let route = c.service.routes().get_for_module("echo").unwrap();
    assert_eq!(route.deployment, key);
    assert_eq!(route.endpoint, "http://10.0.0.7:8894");
}

#[tokio::test]
async fn deployments_with_unknown_references_are_refused() {
    let c = controller();
    let err = c
        .service
        .create_deployment(CreateDeployment {
            schema: "module echo {\n  verb echo(Unit) Unit\n    +calls missing.ref\n}\n".to_string(),
            language: "go".to_string(),
            artefacts: Vec::new(),
        })
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(
        err.to_string()
            .contains(r#"unknown reference "missing.ref", is the type annotated and exported?"#),
        "{err}"
    );
    assert!(c.service.status().deployments.is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_runners_are_reaped() {
    let c = controller();
    let key = deploy_echo(&c.service);
    c.service.update_deploy(&key, Some(1)).unwrap();
    let runner = RunnerKey::new("10.0.0.7", 8894);
    keep_registered(&c.service, &runner, &key);
    wait_for_runner(&c.service).await;
    let mut events = c.service.state().subscribe();

    let leaser = Arc::new(StoreLeaser::new(
        c.store.clone(),
        c.service.key().to_string(),
        c.clock.clone(),
    ));
    let scheduler = Scheduler::new(leaser, SchedulerOptions::default(), c.shutdown.subscribe());
    c.service.schedule_reaper(&scheduler);

    // The first sweep finds nothing stale.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(c.service.status().runners.len(), 1);

    c.clock.advance(Duration::from_secs(11));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(c.service.status().runners.is_empty());
    assert!(matches!(
        events.recv().await,
        Some(ClusterEvent::RunnerDeleted { key }) if key == runner
    ));

    c.shutdown.send(true).unwrap();
    scheduler.join().await;
}

#[tokio::test(start_paused = true)]
async fn deployment_context_is_resent_only_when_it_changes() {
    let c = controller();
    let key = deploy_echo(&c.service);
    let admin = AdminService::new(c.store.clone());

    let mut contexts = c.service.deployment_context(&key).unwrap();
    let first = contexts.recv().await.unwrap();
    assert!(first.configs.is_empty());

    // Several update periods pass without a change.
    assert!(
        tokio::time::timeout(Duration::from_secs(5), contexts.recv())
            .await
            .is_err()
    );

    admin
        .config_set(&ValueRef::scoped("echo", "greeting"), &json!("hello"))
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), contexts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.configs["greeting"], b"\"hello\"".to_vec());
    assert_ne!(second.checksum, first.checksum);
}
