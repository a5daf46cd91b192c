//! Deployment contexts: the config, secrets, databases and routes a
//! deployment needs at runtime, re-sent whenever they change.

use std::collections::BTreeMap;

use ftl_core::{DeploymentKey, Digest};
use ftl_state::Deployment;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ControllerResult, deployment_not_found};
use crate::service::ControllerService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentContext {
    pub module: String,
    pub deployment: DeploymentKey,
    pub configs: BTreeMap<String, Vec<u8>>,
    pub secrets: BTreeMap<String, Vec<u8>>,
    /// Database name to DSN.
    pub databases: BTreeMap<String, String>,
    /// Module name to endpoint, for the modules this one calls.
    pub routes: BTreeMap<String, String>,
    pub checksum: u64,
}

impl ControllerService {
    /// Stream the deployment's context. The first context is sent at once;
    /// after that the context is rebuilt on every context update period
    /// and every routing change, and sent only when its checksum changed.
    pub fn deployment_context(
        &self,
        key: &DeploymentKey,
    ) -> ControllerResult<mpsc::Receiver<DeploymentContext>> {
        if self.state.view().deployment(key).is_none() {
            return Err(deployment_not_found(key));
        }
        let (tx, rx) = mpsc::channel(16);
        let service = self.clone();
        let key = key.clone();
        let period = self.config.context_update_period;
        let mut route_updates = self.routes.subscribe();
        tokio::spawn(async move {
            let mut last = None;
            loop {
                let Some(deployment) = service.state.view().deployment(&key).cloned() else {
                    debug!(deployment = %key, "deployment gone, closing context stream");
                    break;
                };
                match service.build_context(&deployment) {
                    Ok(context) if last != Some(context.checksum) => {
                        last = Some(context.checksum);
                        debug!(deployment = %key, checksum = context.checksum, "sending deployment context");
                        if tx.send(context).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(deployment = %key, error = %e, "failed to build deployment context"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    changed = route_updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(rx)
    }

    fn build_context(&self, deployment: &Deployment) -> ControllerResult<DeploymentContext> {
        let module = deployment.module.as_str();
        let configs = self.admin.map_configs_for_module(module)?;
        let secrets = self.admin.map_secrets_for_module(module)?;
        let databases = deployment
            .schema
            .databases()
            .filter_map(|db| {
                self.config
                    .database_dsn(module, &db.name)
                    .map(|dsn| (db.name.clone(), dsn.to_string()))
            })
            .collect();
        let callable = deployment.schema.callable_modules();
        let routes = self
            .routes
            .current()
            .endpoints_for(callable.iter().map(String::as_str));

        let mut context = DeploymentContext {
            module: module.to_string(),
            deployment: deployment.key.clone(),
            configs,
            secrets,
            databases,
            routes,
            checksum: 0,
        };
        context.checksum = checksum(&context);
        Ok(context)
    }
}

/// A hash of the context's maps. Maps are sorted, so the result does not
/// depend on insertion order.
fn checksum(context: &DeploymentContext) -> u64 {
    let mut buf = Vec::new();
    let mut put = |section: &str, key: &str, value: &[u8]| {
        for part in [section.as_bytes(), key.as_bytes(), value] {
            buf.extend_from_slice(&(part.len() as u64).to_le_bytes());
            buf.extend_from_slice(part);
        }
    };
    for (k, v) in &context.configs {
        put("config", k, v);
    }
    for (k, v) in &context.secrets {
        put("secret", k, v);
    }
    for (k, v) in &context.databases {
        put("database", k, v.as_bytes());
    }
    for (k, v) in &context.routes {
        put("route", k, v.as_bytes());
    }
    let digest = Digest::of(&buf);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(first)
}
