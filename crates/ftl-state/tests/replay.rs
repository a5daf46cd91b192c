//! Replaying persisted cluster events rebuilds the live view.

use chrono::Utc;
use ftl_core::{Digest, DeploymentKey, RunnerKey};
use ftl_schema::Module;
use ftl_state::*;

fn deployment(module: &str) -> Deployment {
    Deployment {
        key: DeploymentKey::new(module),
        module: module.to_string(),
        schema: Module::new(module),
        language: "rust".to_string(),
        artefacts: vec![DeploymentArtefact {
            digest: Digest::of(module.as_bytes()),
            path: "main".to_string(),
            executable: true,
        }],
        created_at: Utc::now(),
        activated_at: None,
        min_replicas: 0,
    }
}

fn lifecycle() -> Vec<ClusterEvent> {
    let echo = deployment("echo");
    let echo2 = deployment("echo");
    let time = deployment("time");
    vec![
        ClusterEvent::DeploymentArtefactCreated {
            digest: echo.artefacts[0].digest,
        },
        ClusterEvent::DeploymentCreated {
            deployment: Box::new(echo.clone()),
        },
        ClusterEvent::DeploymentCreated {
            deployment: Box::new(time.clone()),
        },
        ClusterEvent::DeploymentActivated {
            key: echo.key.clone(),
            activated_at: Utc::now(),
            min_replicas: 1,
        },
        ClusterEvent::DeploymentActivated {
            key: time.key.clone(),
            activated_at: Utc::now(),
            min_replicas: 2,
        },
        ClusterEvent::DeploymentCreated {
            deployment: Box::new(echo2.clone()),
        },
        ClusterEvent::DeploymentActivated {
            key: echo2.key.clone(),
            activated_at: Utc::now(),
            min_replicas: 1,
        },
        ClusterEvent::DeploymentDeactivated {
            key: echo.key.clone(),
            module_removed: false,
        },
        ClusterEvent::DeploymentDeactivated {
            key: time.key.clone(),
            module_removed: true,
        },
    ]
}

#[test]
fn replayed_view_equals_published_view() {
    let events = lifecycle();
    let a = EventStream::new(ClusterView::default());
    for event in events.clone() {
        a.publish(event).unwrap();
    }
    let b = EventStream::replay(ClusterView::default(), events).unwrap();
    assert_eq!(*a.view(), *b.view());
}

#[test]
fn exactly_one_active_deployment_per_module() {
    let state = ClusterState::open(StateStore::open_in_memory().unwrap()).unwrap();
    for event in lifecycle() {
        state.publish(event).unwrap();
        let view = state.view();
        for (module, key) in &view.active {
            let active: Vec<_> = view
                .deployments
                .values()
                .filter(|d| &d.module == module && d.min_replicas > 0 && view.active.get(module) == Some(&d.key))
                .collect();
            assert_eq!(active.len(), 1);
            assert_eq!(&active[0].key, key);
        }
    }
    let view = state.view();
    assert_eq!(view.active.keys().collect::<Vec<_>>(), ["echo"]);
    assert!(view.is_module_removed("time"));
}

#[tokio::test]
async fn subscribers_observe_the_writer_order() {
    let store = StateStore::open_in_memory().unwrap();
    let state = ClusterState::open(store.clone()).unwrap();
    let mut sub = state.subscribe();
    let events = lifecycle();
    for event in events.clone() {
        state.publish(event).unwrap();
    }
    let runner = Runner {
        key: RunnerKey::new("localhost", 9000),
        endpoint: "http://localhost:9000".into(),
        deployment: DeploymentKey::new("echo"),
        module: "echo".into(),
        created_at: Utc::now(),
        last_seen: Utc::now(),
    };
    state
        .publish(ClusterEvent::RunnerRegistered { runner })
        .unwrap();

    for expected in &events {
        assert_eq!(sub.recv().await.as_ref(), Some(expected));
    }
    assert!(matches!(sub.recv().await, Some(ClusterEvent::RunnerRegistered { .. })));
    assert_eq!(store.cluster_events().unwrap(), events);
}
