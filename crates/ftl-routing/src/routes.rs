//! Immutable routing snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ftl_core::DeploymentKey;
use ftl_schema::{Schema, builtins};
use ftl_state::ClusterView;
use serde::Serialize;

/// Where calls to a module go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub module: String,
    pub deployment: DeploymentKey,
    pub endpoint: String,
}

/// A point-in-time routing table and the schema of the active deployments,
/// builtins included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routes {
    routes: BTreeMap<String, Route>,
    schema: Arc<Schema>,
}

impl Routes {
    /// Derive routes from a cluster view.
    ///
    /// A module is routable when it has an active deployment with an
    /// endpoint: its first registered runner, or failing that the endpoint
    /// recorded in the deployment's runtime data.
    pub fn from_view(view: &ClusterView) -> Self {
        let routes = view
            .active_deployments()
            .filter_map(|deployment| {
                let endpoint = view
                    .runners_for(&deployment.key)
                    .first()
                    .map(|runner| runner.endpoint.clone())
                    .or_else(|| {
                        deployment
                            .schema
                            .runtime
                            .as_ref()
                            .and_then(|rt| rt.endpoint.clone())
                    })?;
                Some((
                    deployment.module.clone(),
                    Route {
                        module: deployment.module.clone(),
                        deployment: deployment.key.clone(),
                        endpoint,
                    },
                ))
            })
            .collect();
        let mut schema = view.schema();
        schema.modules.insert(0, builtins().clone());
        Self {
            routes,
            schema: Arc::new(schema),
        }
    }

    pub fn get(&self, module: &str) -> Option<&Route> {
        self.routes.get(module)
    }

    pub fn endpoint(&self, module: &str) -> Option<&str> {
        self.get(module).map(|route| route.endpoint.as_str())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Module name to endpoint, restricted to `modules`.
    pub fn endpoints_for<'a>(
        &self,
        modules: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, String> {
        modules
            .into_iter()
            .filter_map(|m| self.endpoint(m).map(|e| (m.to_string(), e.to_string())))
            .collect()
    }

    /// Modules whose route differs between `self` and `next`.
    pub fn changed_modules(&self, next: &Routes) -> BTreeSet<String> {
        let modules: BTreeSet<&String> = self.routes.keys().chain(next.routes.keys()).collect();
        modules
            .into_iter()
            .filter(|m| self.routes.get(*m) != next.routes.get(*m))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use ftl_core::RunnerKey;
    use ftl_schema::{Module, ModuleRuntime};
    use ftl_state::{ClusterEvent, Deployment, Runner, StreamEvent};

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

    fn activate(view: &mut ClusterView, d: &Deployment) {
        ClusterEvent::DeploymentCreated {
            deployment: Box::new(d.clone()),
        }
        .apply(view)
        .unwrap();
        ClusterEvent::DeploymentActivated {
            key: d.key.clone(),
            activated_at: d.created_at,
            min_replicas: 1,
        }
        .apply(view)
        .unwrap();
    }

    fn register(view: &mut ClusterView, d: &Deployment, port: u16) {
        let runner = Runner {
            key: RunnerKey::new("localhost", port),
            endpoint: format!("http://localhost:{port}"),
            deployment: d.key.clone(),
            module: d.module.clone(),
            created_at: d.created_at,
            last_seen: d.created_at,
        };
        ClusterEvent::RunnerRegistered { runner }.apply(view).unwrap();
    }

    #[test]
    fn modules_need_an_endpoint_to_be_routable() {
        let mut view = ClusterView::default();
        let echo = deployment("echo");
        activate(&mut view, &echo);
        let routes = Routes::from_view(&view);
        assert!(routes.get("echo").is_none());
        assert!(routes.schema().module("echo").is_some());
        assert!(routes.schema().module("builtin").is_some());

        register(&mut view, &echo, 9000);
        let routes = Routes::from_view(&view);
        assert_eq!(routes.endpoint("echo"), Some("http://localhost:9000"));
        assert_eq!(routes.get("echo").unwrap().deployment, echo.key);
    }

    #[test]
    fn runtime_endpoint_is_the_fallback() {
        let mut view = ClusterView::default();
        let mut time = deployment("time");
        time.schema.runtime = Some(ModuleRuntime {
            endpoint: Some("http://time:8080".into()),
            ..ModuleRuntime::default()
        });
        activate(&mut view, &time);
        let routes = Routes::from_view(&view);
        assert_eq!(routes.endpoint("time"), Some("http://time:8080"));
    }

    #[test]
    fn changed_modules_lists_added_removed_and_moved_routes() {
        let mut view = ClusterView::default();
        let echo = deployment("echo");
        let time = deployment("time");
        activate(&mut view, &echo);
        activate(&mut view, &time);
        register(&mut view, &echo, 9000);
        register(&mut view, &time, 9001);
        let before = Routes::from_view(&view);

        let echo2 = deployment("echo");
        activate(&mut view, &echo2);
        register(&mut view, &echo2, 9002);
        ClusterEvent::DeploymentDeactivated {
            key: time.key.clone(),
            module_removed: true,
        }
        .apply(&mut view)
        .unwrap();
        let after = Routes::from_view(&view);

        let changed: Vec<String> = before.changed_modules(&after).into_iter().collect();
        assert_eq!(changed, ["echo", "time"]);
        assert!(after.changed_modules(&after).is_empty());
        assert_eq!(
            after.endpoints_for(["echo", "time"]),
            BTreeMap::from([("echo".to_string(), "http://localhost:9002".to_string())])
        );
    }
}
