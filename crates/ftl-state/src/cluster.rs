//! The cluster view: deployments, runners and known artefacts, derived by
//! reducing [`ClusterEvent`]s through an [`EventStream`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_core::{Digest, DeploymentKey, RunnerKey};
use ftl_schema::{Module, Schema};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClusterError, StateError, StateResult};
use crate::store::StateStore;
use crate::stream::{EventStream, StreamEvent, Subscription};

/// One file shipped with a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentArtefact {
    pub digest: Digest,
    pub path: String,
    #[serde(default)]
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub key: DeploymentKey,
    pub module: String,
    pub schema: Module,
    pub language: String,
    pub artefacts: Vec<DeploymentArtefact>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub min_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub key: RunnerKey,
    pub endpoint: String,
    pub deployment: DeploymentKey,
    pub module: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    RunnerRegistered {
        runner: Runner,
    },
    RunnerDeleted {
        key: RunnerKey,
    },
    DeploymentCreated {
        deployment: Box<Deployment>,
    },
    DeploymentActivated {
        key: DeploymentKey,
        activated_at: DateTime<Utc>,
        min_replicas: u32,
    },
    DeploymentReplicasUpdated {
        key: DeploymentKey,
        min_replicas: u32,
    },
    DeploymentDeactivated {
        key: DeploymentKey,
        module_removed: bool,
    },
    DeploymentSchemaUpdated {
        key: DeploymentKey,
        schema: Box<Module>,
    },
    DeploymentArtefactCreated {
        digest: Digest,
    },
}

impl ClusterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::RunnerRegistered { .. } => "runner_registered",
            ClusterEvent::RunnerDeleted { .. } => "runner_deleted",
            ClusterEvent::DeploymentCreated { .. } => "deployment_created",
            ClusterEvent::DeploymentActivated { .. } => "deployment_activated",
            ClusterEvent::DeploymentReplicasUpdated { .. } => "deployment_replicas_updated",
            ClusterEvent::DeploymentDeactivated { .. } => "deployment_deactivated",
            ClusterEvent::DeploymentSchemaUpdated { .. } => "deployment_schema_updated",
            ClusterEvent::DeploymentArtefactCreated { .. } => "deployment_artefact_created",
        }
    }

    /// Runner events are not persisted: runners re-register after a restart.
    pub fn is_persisted(&self) -> bool {
        !matches!(
            self,
            ClusterEvent::RunnerRegistered { .. } | ClusterEvent::RunnerDeleted { .. }
        )
    }

    /// True for events that can change which endpoint serves a module.
    pub fn changes_routes(&self) -> bool {
        !matches!(self, ClusterEvent::DeploymentArtefactCreated { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterView {
    pub runners: BTreeMap<RunnerKey, Runner>,
    pub runners_by_deployment: BTreeMap<DeploymentKey, BTreeSet<RunnerKey>>,
    pub deployments: BTreeMap<DeploymentKey, Deployment>,
    /// Module name to its single active deployment.
    pub active: BTreeMap<String, DeploymentKey>,
    /// Modules whose last deployment was deactivated with the module removed.
    pub removed_modules: BTreeSet<String>,
    pub artefacts: BTreeSet<Digest>,
}

impl ClusterView {
    pub fn deployment(&self, key: &DeploymentKey) -> Option<&Deployment> {
        self.deployments.get(key)
    }

    pub fn active_deployment(&self, module: &str) -> Option<&Deployment> {
        self.active.get(module).and_then(|key| self.deployments.get(key))
    }

    /// Active deployments ordered by module name.
    pub fn active_deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.active.values().filter_map(|key| self.deployments.get(key))
    }

    pub fn runners_for(&self, deployment: &DeploymentKey) -> Vec<&Runner> {
        self.runners_by_deployment
            .get(deployment)
            .into_iter()
            .flatten()
            .filter_map(|key| self.runners.get(key))
            .collect()
    }

    /// Runners not seen for longer than `timeout`.
    pub fn stale_runners(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<RunnerKey> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.runners
            .values()
            .filter(|runner| now - runner.last_seen > timeout)
            .map(|runner| runner.key.clone())
            .collect()
    }

    /// The schema made of every active deployment's module.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.active_deployments()
                .map(|deployment| deployment.schema.clone())
                .collect(),
        )
    }

    pub fn is_module_removed(&self, module: &str) -> bool {
        self.removed_modules.contains(module)
    }

    fn deployment_mut(&mut self, key: &DeploymentKey) -> Result<&mut Deployment, ClusterError> {
        self.deployments
            .get_mut(key)
            .ok_or_else(|| ClusterError::DeploymentNotFound(key.clone()))
    }

    fn unindex_runner(&mut self, runner: &Runner) {
        if let Some(keys) = self.runners_by_deployment.get_mut(&runner.deployment) {
            keys.remove(&runner.key);
            if keys.is_empty() {
                self.runners_by_deployment.remove(&runner.deployment);
            }
        }
    }
}

impl StreamEvent<ClusterView> for ClusterEvent {
    type Error = ClusterError;

    fn apply(&self, view: &mut ClusterView) -> Result<(), ClusterError> {
        match self {
            ClusterEvent::RunnerRegistered { runner } => {
                if let Some(existing) = view.runners.get(&runner.key).cloned() {
                    view.unindex_runner(&existing);
                    let updated = Runner {
                        created_at: existing.created_at,
                        ..runner.clone()
                    };
                    view.runners.insert(runner.key.clone(), updated);
                } else {
                    view.runners.insert(runner.key.clone(), runner.clone());
                }
                view.runners_by_deployment
                    .entry(runner.deployment.clone())
                    .or_default()
                    .insert(runner.key.clone());
            }
            ClusterEvent::RunnerDeleted { key } => {
                if let Some(runner) = view.runners.remove(key) {
                    view.unindex_runner(&runner);
                }
            }
            ClusterEvent::DeploymentCreated { deployment } => {
                if !view.deployments.contains_key(&deployment.key) {
                    let mut deployment = deployment.as_ref().clone();
                    deployment.min_replicas = 0;
                    deployment.activated_at = None;
                    view.deployments.insert(deployment.key.clone(), deployment);
                }
            }
            ClusterEvent::DeploymentActivated {
                key,
                activated_at,
                min_replicas,
            } => {
                if *min_replicas == 0 {
                    return Err(ClusterError::InvalidReplicas(key.clone()));
                }
                let deployment = view.deployment_mut(key)?;
                deployment.activated_at = Some(*activated_at);
                deployment.min_replicas = *min_replicas;
                let module = deployment.module.clone();
                view.removed_modules.remove(&module);
                view.active.insert(module, key.clone());
            }
            ClusterEvent::DeploymentReplicasUpdated { key, min_replicas } => {
                view.deployment_mut(key)?.min_replicas = *min_replicas;
            }
            ClusterEvent::DeploymentDeactivated {
                key,
                module_removed,
            } => {
                let deployment = view.deployment_mut(key)?;
                deployment.min_replicas = 0;
                let module = deployment.module.clone();
                if view.active.get(&module) == Some(key) {
                    view.active.remove(&module);
                }
                if *module_removed && !view.active.contains_key(&module) {
                    view.removed_modules.insert(module);
                }
            }
            ClusterEvent::DeploymentSchemaUpdated { key, schema } => {
                view.deployment_mut(key)?.schema = schema.as_ref().clone();
            }
            ClusterEvent::DeploymentArtefactCreated { digest } => {
                view.artefacts.insert(*digest);
            }
        }
        Ok(())
    }
}

/// The live cluster view, persisted through the [`StateStore`].
#[derive(Clone)]
pub struct ClusterState {
    stream: EventStream<ClusterView, ClusterEvent>,
    store: StateStore,
}

impl ClusterState {
    /// Rebuild the view from persisted deployment events.
    pub fn open(store: StateStore) -> StateResult<Self> {
        let mut view = ClusterView::default();
        let events = store.cluster_events()?;
        let count = events.len();
        for event in events {
            let mut next = view.clone();
            match event.apply(&mut next) {
                Ok(()) => view = next,
                Err(e) => warn!(event = event.name(), error = %e, "skipping unreplayable cluster event"),
            }
        }
        debug!(events = count, deployments = view.deployments.len(), "cluster state replayed");
        Ok(Self {
            stream: EventStream::new(view),
            store,
        })
    }

    /// Apply, persist and broadcast an event.
    pub fn publish(&self, event: ClusterEvent) -> StateResult<Arc<ClusterView>> {
        let name = event.name();
        let view = self.stream.publish_then::<StateError, _>(event, |event| {
            if event.is_persisted() {
                self.store.append_cluster_events([event])?;
            }
            Ok(())
        })?;
        debug!(event = name, "cluster event published");
        Ok(view)
    }

    /// Choose events from the current view and apply, persist and broadcast
    /// them as one step. No other event lands between the checks `decide`
    /// makes and the events it returns.
    pub fn publish_with<T, X>(
        &self,
        decide: impl FnOnce(&ClusterView) -> Result<(Vec<ClusterEvent>, T), X>,
    ) -> Result<T, X>
    where
        X: From<StateError> + From<ClusterError>,
    {
        let (_, value) = self.stream.publish_with(decide, |events| {
            self.store
                .append_cluster_events(events.iter().filter(|event| event.is_persisted()))?;
            for event in events {
                debug!(event = event.name(), "cluster event published");
            }
            Ok(())
        })?;
        Ok(value)
    }

    pub fn view(&self) -> Arc<ClusterView> {
        self.stream.view()
    }

    pub fn subscribe(&self) -> Subscription<ClusterEvent> {
        self.stream.subscribe()
    }

    pub fn subscribe_with_view(&self) -> (Arc<ClusterView>, Subscription<ClusterEvent>) {
        self.stream.subscribe_with_view()
    }

    pub fn unsubscribe(&self, subscription: Subscription<ClusterEvent>) {
        self.stream.unsubscribe(subscription)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }
}
