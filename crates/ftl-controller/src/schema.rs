//! The schema service: the current schema and a stream of module changes.

use std::collections::BTreeMap;

use ftl_core::DeploymentKey;
use ftl_schema::{BUILTIN_MODULE, Module, ModuleRuntime, Schema, builtins};
use ftl_state::{ClusterView, Deployment, StreamEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::service::ControllerService;

const UPDATE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaUpdate {
    pub deployment: Option<DeploymentKey>,
    pub module_name: String,
    pub schema: Module,
    pub change_type: ChangeType,
    /// More updates of the initial batch follow.
    pub more: bool,
    pub module_removed: bool,
}

impl ControllerService {
    /// Builtins plus the module of every active deployment.
    pub fn get_schema(&self) -> Schema {
        let view = self.state.view();
        let mut modules = vec![builtins().clone()];
        modules.extend(active_modules(&view).into_values().map(|(_, module)| module));
        Schema::new(modules)
    }

    /// Stream the schema: first the builtins and every active module, then
    /// a change each time a module is activated, replaced, updated or
    /// removed. The stream ends when the receiver is dropped.
    pub fn pull_schema(&self) -> mpsc::Receiver<SchemaUpdate> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let state = self.state.clone();
        tokio::spawn(async move {
            let (view, mut events) = state.subscribe_with_view();
            let mut view = view.as_ref().clone();
            let mut sent = active_modules(&view);

            let mut remaining = sent.len();
            let seed = SchemaUpdate {
                deployment: None,
                module_name: BUILTIN_MODULE.to_string(),
                schema: builtins().clone(),
                change_type: ChangeType::Added,
                more: remaining > 0,
                module_removed: false,
            };
            if tx.send(seed).await.is_err() {
                state.unsubscribe(events);
                return;
            }
            for (name, (key, module)) in &sent {
                remaining -= 1;
                let update = SchemaUpdate {
                    deployment: Some(key.clone()),
                    module_name: name.clone(),
                    schema: module.clone(),
                    change_type: ChangeType::Added,
                    more: remaining > 0,
                    module_removed: false,
                };
                if tx.send(update).await.is_err() {
                    state.unsubscribe(events);
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(e) = event.apply(&mut view) {
                                    warn!(event = event.name(), error = %e, "schema stream resynchronising");
                                    view = state.view().as_ref().clone();
                                }
                            }
                            None => {
                                debug!("schema stream subscription dropped, resubscribing");
                                let (latest, resubscribed) = state.subscribe_with_view();
                                view = latest.as_ref().clone();
                                events = resubscribed;
                            }
                        }
                        for update in diff(&view, &mut sent) {
                            if tx.send(update).await.is_err() {
                                state.unsubscribe(events);
                                return;
                            }
                        }
                    }
                }
            }
            state.unsubscribe(events);
            debug!("schema stream closed");
        });
        rx
    }
}

type Sent = BTreeMap<String, (DeploymentKey, Module)>;

/// The module of a deployment as clients see it, with its runtime facts.
pub(crate) fn module_with_runtime(deployment: &Deployment) -> Module {
    let mut module = deployment.schema.clone();
    let runtime = module.runtime.get_or_insert_with(ModuleRuntime::default);
    runtime.create_time.get_or_insert(deployment.created_at);
    if runtime.language.is_empty() {
        runtime.language = deployment.language.clone();
    }
    runtime.min_replicas = deployment.min_replicas;
    runtime.deployment = Some(deployment.key.to_string());
    module
}

fn active_modules(view: &ClusterView) -> Sent {
    view.active_deployments()
        .map(|d| (d.module.clone(), (d.key.clone(), module_with_runtime(d))))
        .collect()
}

fn diff(view: &ClusterView, sent: &mut Sent) -> Vec<SchemaUpdate> {
    let current = active_modules(view);
    let mut updates = Vec::new();
    for (name, (key, module)) in &current {
        let change_type = match sent.get(name) {
            None => ChangeType::Added,
            Some((k, m)) if k != key || m != module => ChangeType::Changed,
            Some(_) => continue,
        };
        updates.push(SchemaUpdate {
            deployment: Some(key.clone()),
            module_name: name.clone(),
            schema: module.clone(),
            change_type,
            more: false,
            module_removed: false,
        });
    }
    for (name, (key, module)) in sent.iter() {
        if !current.contains_key(name) {
            updates.push(SchemaUpdate {
                deployment: Some(key.clone()),
                module_name: name.clone(),
                schema: module.clone(),
                change_type: ChangeType::Removed,
                more: false,
                module_removed: view.is_module_removed(name),
            });
        }
    }
    *sent = current;
    updates
}
