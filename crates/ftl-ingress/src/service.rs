//! Serving one HTTP request through an ingress verb.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ftl_core::{Clock, ErrorCode, Origin, RefKey, RequestKey};
use ftl_dispatch::{CallContext, CallRequest, Dispatcher};
use ftl_routing::Routes;
use ftl_timeline::{EventPayload, TimelineClient, TimelineEvent};
use http::StatusCode;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::IngressError;
use crate::request::{HttpParts, build_request};
use crate::response::{HttpReply, unpack_response};
use crate::route::IngressTable;

/// An HTTP request as received by the ingress server.
#[derive(Debug, Clone, Default)]
pub struct IngressRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

type CachedTable = (Arc<Routes>, Arc<IngressTable>);

#[derive(Clone)]
pub struct IngressService {
    dispatcher: Dispatcher,
    timeline: TimelineClient,
    clock: Arc<dyn Clock>,
    table: Arc<Mutex<Option<CachedTable>>>,
}

/// How far a request got, for its Ingress event.
struct Handled {
    reply: HttpReply,
    request: String,
    response: Option<String>,
    error: Option<String>,
}

impl IngressService {
    pub fn new(dispatcher: Dispatcher, timeline: TimelineClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            dispatcher,
            timeline,
            clock,
            table: Arc::default(),
        }
    }

    /// The ingress routes of the current routing snapshot. Rebuilt only when
    /// the snapshot changes.
    pub fn table(&self) -> (Arc<Routes>, Arc<IngressTable>) {
        let routes = self.dispatcher.routes().current();
        let mut cached = self.table.lock().expect("ingress table lock");
        if let Some((seen, table)) = cached.as_ref() {
            if Arc::ptr_eq(seen, &routes) {
                return (routes, Arc::clone(table));
            }
        }
        let table = Arc::new(IngressTable::from_schema(routes.schema()));
        debug!(routes = table.len(), "ingress routes rebuilt");
        *cached = Some((Arc::clone(&routes), Arc::clone(&table)));
        (routes, table)
    }

    /// Serve a request. Failures become HTTP error responses; nothing is
    /// returned as an error.
    pub async fn handle(&self, request: IngressRequest) -> HttpReply {
        let span = info_span!("ingress", method = %request.method, path = %request.path);
        self.serve(request).instrument(span).await
    }

    async fn serve(&self, request: IngressRequest) -> HttpReply {
        let (routes, table) = self.table();
        let Some((route, parameters)) = table.lookup(&request.method, &request.path) else {
            debug!("no ingress route");
            return error_reply(&IngressError::RouteNotFound);
        };
        let Some(verb) = routes.schema().resolve_verb(&route.verb) else {
            return error_reply(&IngressError::RouteNotFound);
        };

        let started_at = self.clock.now();
        let started = Instant::now();
        let request_key = RequestKey::new(
            Origin::Ingress,
            &format!("{} {}", request.method, request.path),
        );
        let handled = self
            .call(&routes, &route.verb, verb, &parameters, &request, request_key.clone())
            .await;
        if let Some(error) = &handled.error {
            warn!(verb = %route.verb, status = handled.reply.status, %error, "ingress request failed");
        }

        let mut event = TimelineEvent::new(EventPayload::Ingress {
            verb: route.verb.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            status: handled.reply.status,
            request: handled.request,
            response: handled.response,
            error: handled.error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
        .at(started_at)
        .request(Some(request_key));
        if let Some(serving) = routes.get(&route.verb.module) {
            event = event.deployment(serving.deployment.clone());
        }
        self.timeline.publish(event);
        handled.reply
    }

    async fn call(
        &self,
        routes: &Routes,
        reference: &RefKey,
        verb: &ftl_schema::Verb,
        parameters: &BTreeMap<String, String>,
        request: &IngressRequest,
        request_key: RequestKey,
    ) -> Handled {
        let parts = HttpParts {
            method: &request.method,
            path: &request.path,
            query: request.query.as_deref(),
            headers: &request.headers,
            body: &request.body,
        };
        let body = match build_request(routes.schema(), verb, parameters, &parts) {
            Ok(body) => body.to_string(),
            Err(e) => return Handled::failed(String::from_utf8_lossy(&request.body).into_owned(), &e),
        };

        let call = CallRequest {
            verb: Some(reference.clone()),
            body: Some(body.clone().into_bytes()),
            remote_addr: request.remote_addr,
        };
        let context = CallContext {
            request_key: Some(request_key),
            ..CallContext::default()
        };
        let raw = match self.dispatcher.call(call, context).await {
            Ok(raw) => raw,
            Err(e) => return Handled::failed(body, &IngressError::from(e)),
        };
        let response = String::from_utf8_lossy(&raw).into_owned();
        match unpack_response(verb, &raw) {
            Ok(reply) => Handled {
                reply,
                request: body,
                response: Some(response),
                error: None,
            },
            Err(e) => Handled {
                reply: error_reply(&e),
                request: body,
                response: Some(response),
                error: Some(e.to_string()),
            },
        }
    }
}

impl Handled {
    fn failed(request: String, error: &IngressError) -> Self {
        Self {
            reply: error_reply(error),
            request,
            response: None,
            error: Some(error.to_string()),
        }
    }
}

/// Client errors carry their message. Server errors only carry the
/// status's reason phrase.
fn error_reply(error: &IngressError) -> HttpReply {
    let status = error.code().http_status();
    let message = match StatusCode::from_u16(status) {
        Ok(code) if code.is_client_error() => error.to_string(),
        Ok(code) => code.canonical_reason().unwrap_or("error").to_string(),
        Err(_) => error.to_string(),
    };
    HttpReply::text(status, message)
}
