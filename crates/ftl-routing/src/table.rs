//! The live routing table.
//!
//! Snapshots are derived from the cluster view on demand: `current()` compares
//! the cluster view it last derived from with the latest one and rebuilds
//! when they differ. A call routed after an activation was published
//! therefore always sees it. Subscribers are notified through a `watch`
//! channel whenever a rebuilt snapshot differs from the previous one.

use std::sync::{Arc, Mutex};

use ftl_state::{ClusterState, ClusterView};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::routes::{Route, Routes};

struct Cached {
    view: Arc<ClusterView>,
    routes: Arc<Routes>,
}

#[derive(Clone)]
pub struct RouteTable {
    state: ClusterState,
    cached: Arc<Mutex<Cached>>,
    updates: Arc<watch::Sender<Arc<Routes>>>,
}

impl RouteTable {
    pub fn new(state: ClusterState) -> Self {
        let view = state.view();
        let routes = Arc::new(Routes::from_view(&view));
        let (updates, _) = watch::channel(Arc::clone(&routes));
        Self {
            state,
            cached: Arc::new(Mutex::new(Cached { view, routes })),
            updates: Arc::new(updates),
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<Routes> {
        let mut cached = self.cached.lock().expect("routing table lock");
        // Read under the lock so an older view never replaces a newer one.
        let view = self.state.view();
        if Arc::ptr_eq(&cached.view, &view) {
            return Arc::clone(&cached.routes);
        }
        let routes = Routes::from_view(&view);
        cached.view = view;
        if routes != *cached.routes {
            let changed = cached.routes.changed_modules(&routes);
            if !changed.is_empty() {
                debug!(?changed, "routing table changed");
            }
            cached.routes = Arc::new(routes);
            self.updates.send_replace(Arc::clone(&cached.routes));
        }
        Arc::clone(&cached.routes)
    }

    pub fn get_for_module(&self, module: &str) -> Option<Route> {
        self.current().get(module).cloned()
    }

    /// Receive each new snapshot. The receiver starts at the current one;
    /// drop it to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Routes>> {
        self.current();
        self.updates.subscribe()
    }

    /// Rebuild the table as route-changing cluster events arrive, so that
    /// subscribers hear about changes without anyone calling `current()`.
    pub fn spawn_watcher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let mut events = table.state.subscribe();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            if event.changes_routes() {
                                table.current();
                            }
                        }
                        None => {
                            // Dropped as a slow subscriber: catch up and rejoin.
                            events = table.state.subscribe();
                            table.current();
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("routing table watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use ftl_core::{DeploymentKey, RunnerKey};
    use ftl_schema::Module;
    use ftl_state::{ClusterEvent, Deployment, Runner, StateStore};

    use super::*;

    fn deployment(module: &str) -> Deployment {
        Deployment {
            key: DeploymentKey::new(module),
            module: module.to_string(),
            schema: Module::new(module),
            language: "go".to_string(),
            artefacts: Vec::new(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            activated_at: None,
            min_replicas: 0,
        }
    }

    fn activate(state: &ClusterState, d: &Deployment) {
        state
            .publish(ClusterEvent::DeploymentCreated {
                deployment: Box::new(d.clone()),
            })
            .unwrap();
        state
            .publish(ClusterEvent::DeploymentActivated {
                key: d.key.clone(),
                activated_at: d.created_at,
                min_replicas: 1,
            })
            .unwrap();
    }

    fn runner(d: &Deployment, port: u16) -> ClusterEvent {
        ClusterEvent::RunnerRegistered {
            runner: Runner {
                key: RunnerKey::new("localhost", port),
                endpoint: format!("http://localhost:{port}"),
                deployment: d.key.clone(),
                module: d.module.clone(),
                created_at: d.created_at,
                last_seen: d.created_at,
            },
        }
    }

    fn state() -> ClusterState {
        ClusterState::open(StateStore::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn routes_follow_the_cluster_without_a_watcher() {
        let state = state();
        let table = RouteTable::new(state.clone());
        let echo = deployment("echo");
        activate(&state, &echo);
        assert!(table.get_for_module("echo").is_none());

        state.publish(runner(&echo, 9000)).unwrap();
        let route = table.get_for_module("echo").unwrap();
        assert_eq!(route.deployment, echo.key);
        assert_eq!(route.endpoint, "http://localhost:9000");
    }

    #[test]
    fn snapshots_are_immutable() {
        let state = state();
        let table = RouteTable::new(state.clone());
        let echo = deployment("echo");
        activate(&state, &echo);
        state.publish(runner(&echo, 9000)).unwrap();
        let before = table.current();

        state
            .publish(ClusterEvent::DeploymentDeactivated {
                key: echo.key.clone(),
                module_removed: true,
            })
            .unwrap();
        assert!(table.current().get("echo").is_none());
        assert_eq!(before.endpoint("echo"), Some("http://localhost:9000"));
    }

    #[test]
    fn concurrent_readers_settle_on_the_latest_view() {
        let state = state();
        let table = RouteTable::new(state.clone());
        let updates = table.subscribe();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        table.current();
                    }
                });
            }
            scope.spawn(|| {
                for port in 9000..9050 {
                    let d = deployment(&format!("m{port}"));
                    activate(&state, &d);
                    state.publish(runner(&d, port)).unwrap();
                    table.current();
                }
            });
        });

        let latest = table.current();
        assert_eq!(latest.get("m9049").unwrap().endpoint, "http://localhost:9049");
        assert_eq!(*latest, Routes::from_view(&state.view()));
        assert_eq!(**updates.borrow(), *latest);
    }

    #[tokio::test]
    async fn watcher_notifies_subscribers() {
        let state = state();
        let table = RouteTable::new(state.clone());
        let (_tx, shutdown) = watch::channel(false);
        let _watcher = table.spawn_watcher(shutdown);
        let mut updates = table.subscribe();
        tokio::task::yield_now().await;

        let echo = deployment("echo");
        activate(&state, &echo);
        state.publish(runner(&echo, 9000)).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                updates.changed().await.unwrap();
                if updates.borrow_and_update().get("echo").is_some() {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }
}
