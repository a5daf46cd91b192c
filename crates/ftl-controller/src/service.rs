//! The controller service and its status reports.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ftl_admin::AdminService;
use ftl_core::{Clock, ControllerConfig, ControllerKey, DeploymentKey, RunnerKey};
use ftl_routing::{Route, RouteTable};
use ftl_schema::Module;
use ftl_state::{ClusterState, Deployment};
use ftl_timeline::TimelineClient;
use serde::Serialize;
use url::Url;

use crate::error::{ControllerError, ControllerResult};

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub key: ControllerKey,
    pub endpoint: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub key: RunnerKey,
    pub endpoint: String,
    pub deployment: DeploymentKey,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub key: DeploymentKey,
    pub name: String,
    pub language: String,
    pub min_replicas: u32,
    /// Runners currently registered for the deployment.
    pub replicas: usize,
    pub schema: Module,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub controllers: Vec<ControllerStatus>,
    pub runners: Vec<RunnerStatus>,
    pub deployments: Vec<DeploymentStatus>,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRunner {
    pub key: RunnerKey,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Process {
    pub deployment: DeploymentKey,
    pub min_replicas: u32,
    pub runner: Option<ProcessRunner>,
}

/// Deployment lifecycle, runner registration, schema and deployment
/// context for a single controller.
#[derive(Clone)]
pub struct ControllerService {
    pub(crate) key: ControllerKey,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) state: ClusterState,
    pub(crate) routes: RouteTable,
    pub(crate) timeline: TimelineClient,
    pub(crate) admin: AdminService,
    pub(crate) clock: Arc<dyn Clock>,
}

impl ControllerService {
    pub fn new(
        config: Arc<ControllerConfig>,
        state: ClusterState,
        routes: RouteTable,
        timeline: TimelineClient,
        admin: AdminService,
        clock: Arc<dyn Clock>,
    ) -> ControllerResult<Self> {
        let key = controller_key(config.advertise_url())?;
        Ok(Self {
            key,
            config,
            state,
            routes,
            timeline,
            admin,
            clock,
        })
    }

    pub fn key(&self) -> &ControllerKey {
        &self.key
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn ping(&self) {}

    pub fn status(&self) -> Status {
        let view = self.state.view();
        let routes = self.routes.current();
        let runners = view
            .runners
            .values()
            .map(|r| RunnerStatus {
                key: r.key.clone(),
                endpoint: r.endpoint.clone(),
                deployment: r.deployment.clone(),
                last_seen: r.last_seen,
            })
            .collect();
        let deployments = view
            .deployments
            .values()
            .filter(|d| is_listed(d))
            .map(|d| DeploymentStatus {
                key: d.key.clone(),
                name: d.module.clone(),
                language: d.language.clone(),
                min_replicas: d.min_replicas,
                replicas: view.runners_for(&d.key).len(),
                schema: d.schema.clone(),
            })
            .collect();
        Status {
            controllers: vec![ControllerStatus {
                key: self.key.clone(),
                endpoint: self.config.advertise_url().to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }],
            runners,
            deployments,
            routes: routes.iter().cloned().collect(),
        }
    }

    /// One entry per runner of each listed deployment, or a single
    /// runnerless entry when none is registered.
    pub fn process_list(&self) -> Vec<Process> {
        let view = self.state.view();
        let mut processes = Vec::new();
        for deployment in view.deployments.values().filter(|d| is_listed(d)) {
            let runners = view.runners_for(&deployment.key);
            if runners.is_empty() {
                processes.push(Process {
                    deployment: deployment.key.clone(),
                    min_replicas: deployment.min_replicas,
                    runner: None,
                });
            }
            for runner in runners {
                processes.push(Process {
                    deployment: deployment.key.clone(),
                    min_replicas: deployment.min_replicas,
                    runner: Some(ProcessRunner {
                        key: runner.key.clone(),
                        endpoint: runner.endpoint.clone(),
                    }),
                });
            }
        }
        processes
    }
}

/// Deployments that are running or have never been activated. Retired
/// deployments stay in the view but are not reported.
fn is_listed(deployment: &Deployment) -> bool {
    deployment.min_replicas > 0 || deployment.activated_at.is_none()
}

fn controller_key(advertise: &str) -> ControllerResult<ControllerKey> {
    let url = Url::parse(advertise)
        .map_err(|e| ControllerError::InvalidArgument(format!("invalid advertise URL: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ControllerError::InvalidArgument("advertise URL has no host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ControllerError::InvalidArgument("advertise URL has no port".into()))?;
    Ok(ControllerKey::new(host, port))
}

pub(crate) fn parse_deployment_key(text: &str) -> ControllerResult<DeploymentKey> {
    DeploymentKey::parse(text)
        .map_err(|e| ControllerError::InvalidArgument(format!("invalid deployment key: {e}")))
}


#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;

    #[tokio::test]
    async fn status_reports_this_controller() {
        let h = harness();
        let status = h.service.status();
        assert_eq!(status.controllers.len(), 1);
        assert_eq!(status.controllers[0].endpoint, "http://127.0.0.1:8892");
        assert_eq!(status.controllers[0].key.payload().port, "8892");
        assert!(status.deployments.is_empty());
        assert!(h.service.process_list().is_empty());
    }

    #[test]
    fn controller_keys_come_from_the_advertise_url() {
        let key = controller_key("https://ftl.example.com").unwrap();
        assert_eq!(key.payload().hostname, "ftl.example.com");
        assert_eq!(key.payload().port, "443");
        assert!(controller_key("not a url").is_err());
    }
}
