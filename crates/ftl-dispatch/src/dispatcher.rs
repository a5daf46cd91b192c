//! The call dispatcher: resolve, authorise, validate, route and record.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use ftl_core::{Clock, DeploymentKey, Origin, RefKey, RequestKey};
use ftl_routing::{RouteTable, Routes};
use ftl_schema::validate_request_body;
use ftl_timeline::{EventPayload, TimelineClient, TimelineEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::ClientCache;
use crate::client::VerbRequest;
use crate::error::{DispatchError, DispatchResult};
use crate::headers::CallContext;

#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub verb: Option<RefKey>,
    pub body: Option<Vec<u8>>,
    /// Where an external call came from, for the record.
    pub remote_addr: Option<SocketAddr>,
}

impl CallRequest {
    pub fn new(verb: RefKey, body: Vec<u8>) -> Self {
        Self {
            verb: Some(verb),
            body: Some(body),
            remote_addr: None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    routes: RouteTable,
    clients: Arc<ClientCache>,
    timeline: TimelineClient,
    clock: Arc<dyn Clock>,
}

/// What is known about a call by the time it finishes, for its Call event.
struct Outcome<'a> {
    verb: &'a RefKey,
    caller: Option<&'a RefKey>,
    context: &'a CallContext,
    deployment: Option<DeploymentKey>,
    body: &'a [u8],
}

impl Dispatcher {
    pub fn new(
        routes: RouteTable,
        clients: Arc<ClientCache>,
        timeline: TimelineClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            routes,
            clients,
            timeline,
            clock,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    /// Call a verb on behalf of `context`. The request key is taken from the
    /// context or minted for an external caller.
    pub async fn call(&self, request: CallRequest, context: CallContext) -> DispatchResult<Vec<u8>> {
        let verb_name = request
            .verb
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let span = info_span!("call", verb = %verb_name);
        self.dispatch(request, context).instrument(span).await
    }

    async fn dispatch(&self, request: CallRequest, mut context: CallContext) -> DispatchResult<Vec<u8>> {
        let verb = request
            .verb
            .ok_or_else(|| DispatchError::InvalidArgument("verb is required".into()))?;
        let body = request
            .body
            .ok_or_else(|| DispatchError::InvalidArgument("body is required".into()))?;

        let routes = self.routes.current();
        let Some(decl) = routes.schema().resolve_verb(&verb) else {
            return Err(DispatchError::NotFound(format!("verb {verb} not found")));
        };
        let caller = context.current_caller().cloned();

        if context.request_key.is_none() {
            let key = RequestKey::new(Origin::Ingress, "call");
            debug!(request = %key, remote = ?request.remote_addr, "minted request key");
            context.request_key = Some(key);
        }

        let started_at = self.clock.now();
        let started = Instant::now();
        let mut outcome = Outcome {
            verb: &verb,
            caller: caller.as_ref(),
            context: &context,
            deployment: None,
            body: &body,
        };
        let result = self.route(&routes, decl, &mut outcome).await;
        self.record(&outcome, &result, started_at, started);
        if let Err(e) = &result {
            warn!(error = %e, "call failed");
        }
        result
    }

    async fn route(
        &self,
        routes: &Routes,
        decl: &ftl_schema::Verb,
        outcome: &mut Outcome<'_>,
    ) -> DispatchResult<Vec<u8>> {
        let verb = outcome.verb;
        let Some(route) = routes.get(&verb.module) else {
            return Err(DispatchError::Unavailable(format!(
                "no routes for module {:?}",
                verb.module
            )));
        };
        outcome.deployment = Some(route.deployment.clone());

        if let Some(caller) = outcome.caller {
            if caller.module != verb.module && !decl.export {
                return Err(DispatchError::PermissionDenied(format!(
                    "verb {verb} is not exported"
                )));
            }
        }
        validate_request_body(routes.schema(), decl, outcome.body)?;

        let client = self.clients.get(&route.endpoint);
        let downstream = CallContext {
            direct: false,
            callers: outcome.context.with_caller(verb),
            request_key: outcome.context.request_key.clone(),
            parent_request_key: outcome.context.parent_request_key.clone(),
        };
        client
            .call(VerbRequest {
                verb: verb.clone(),
                body: outcome.body.to_vec(),
                context: downstream,
            })
            .await
    }

    fn record(
        &self,
        outcome: &Outcome<'_>,
        result: &DispatchResult<Vec<u8>>,
        started_at: chrono::DateTime<chrono::Utc>,
        started: Instant,
    ) {
        let (response, error) = match result {
            Ok(body) => (Some(String::from_utf8_lossy(body).into_owned()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let mut event = TimelineEvent::new(EventPayload::Call {
            source: outcome.caller.cloned(),
            destination: outcome.verb.clone(),
            parent_request_key: outcome.context.parent_request_key.clone(),
            request: String::from_utf8_lossy(outcome.body).into_owned(),
            response,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
        .at(started_at)
        .request(outcome.context.request_key.clone());
        if let Some(deployment) = &outcome.deployment {
            event = event.deployment(deployment.clone());
        }
        self.timeline.publish(event);
    }

    /// Drop the clients of modules whose route changes, until shutdown.
    pub fn spawn_route_watcher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut updates = self.routes.subscribe();
        let mut previous = updates.borrow_and_update().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = updates.borrow_and_update().clone();
                        let changed: BTreeSet<String> = previous.changed_modules(&next);
                        for module in &changed {
                            if let Some(endpoint) = previous.endpoint(module) {
                                dispatcher.clients.evict(endpoint);
                            }
                        }
                        previous = next;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("dispatcher route watcher stopped");
        })
    }
}
