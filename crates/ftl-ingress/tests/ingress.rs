//! Ingress requests served through the router against a fake runner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use ftl_core::{DeploymentKey, ManualClock, RefKey, RunnerKey};
use ftl_dispatch::{
    ClientCache, ClientFactory, DispatchError, DispatchResult, Dispatcher, VerbClient, VerbRequest,
};
use ftl_ingress::{IngressService, router};
use ftl_routing::RouteTable;
use ftl_state::{ClusterEvent, ClusterState, Deployment, Runner, StateStore};
use ftl_timeline::{
    EventPayload, EventType, InMemoryTimeline, TimelineClient, TimelineFilter, TimelineQuery,
};
use serde_json::{Value as Json, json};
use tokio::sync::watch;
use tower::ServiceExt;

const SCHEMA: &str = r#"
module shop {
  export data Item {
    id Int
    name String
  }

  export verb get(builtin.HttpRequest<Unit, {String: String}, Unit>) builtin.HttpResponse<shop.Item, String>
    +ingress http GET /items/{id}

  export verb create(builtin.HttpRequest<shop.Item, Unit, Unit>) builtin.HttpResponse<shop.Item, String>
    +ingress http POST /items

  export verb broken(builtin.HttpRequest<Unit, Unit, Unit>) builtin.HttpResponse<String, String>
    +ingress http GET /broken
}
"#;

type Requests = Arc<Mutex<Vec<Json>>>;

/// Answers like a small shop module would.
struct Shop(Requests);

#[async_trait]
impl VerbClient for Shop {
    async fn call(&self, request: VerbRequest) -> DispatchResult<Vec<u8>> {
        let body: Json = serde_json::from_slice(&request.body).unwrap();
        self.0.lock().unwrap().push(body.clone());
        let response = match request.verb.name.as_str() {
            "get" => {
                let id: i64 = body["pathParameters"]["id"].as_str().unwrap().parse().unwrap();
                json!({"body": {"id": id, "name": "widget"}, "headers": {"X-Item": [id.to_string()]}})
            }
            "create" => json!({"status": 201, "body": body["body"]}),
            _ => return Err(DispatchError::Unavailable("runner is down".into())),
        };
        Ok(serde_json::to_vec(&response).unwrap())
    }
}

struct Fixture {
    app: axum::Router,
    requests: Requests,
    timeline: Arc<InMemoryTimeline>,
    deployment: DeploymentKey,
    _shutdown: watch::Sender<bool>,
}

fn fixture() -> Fixture {
    let state = ClusterState::open(StateStore::open_in_memory().unwrap()).unwrap();
    let (shutdown, rx) = watch::channel(false);
    let timeline = Arc::new(InMemoryTimeline::new());
    let (client, _) = TimelineClient::spawn(timeline.clone(), rx);
    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));

    let requests: Requests = Arc::default();
    let seen = Arc::clone(&requests);
    let factory: ClientFactory =
        Arc::new(move |_: &str| Arc::new(Shop(Arc::clone(&seen))) as Arc<dyn VerbClient>);
    let dispatcher = Dispatcher::new(
        RouteTable::new(state.clone()),
        Arc::new(ClientCache::new(Duration::from_secs(60), factory)),
        client.clone(),
        clock.clone(),
    );
    let deployment = deploy(&state);
    Fixture {
        app: router(IngressService::new(dispatcher, client, clock)),
        requests,
        timeline,
        deployment,
        _shutdown: shutdown,
    }
}

fn deploy(state: &ClusterState) -> DeploymentKey {
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let deployment = Deployment {
        key: DeploymentKey::new("shop"),
        module: "shop".to_string(),
        schema: ftl_schema::parse_module_string("shop.ftl", SCHEMA).unwrap(),
        language: "go".to_string(),
        artefacts: Vec::new(),
        created_at: now,
        activated_at: None,
        min_replicas: 0,
    };
    let key = deployment.key.clone();
    state
        .publish(ClusterEvent::DeploymentCreated {
            deployment: Box::new(deployment),
        })
        .unwrap();
    state
        .publish(ClusterEvent::DeploymentActivated {
            key: key.clone(),
            activated_at: now,
            min_replicas: 1,
        })
        .unwrap();
    state
        .publish(ClusterEvent::RunnerRegistered {
            runner: Runner {
                key: RunnerKey::new("localhost", 9300),
                endpoint: "http://localhost:9300".to_string(),
                deployment: key.clone(),
                module: "shop".to_string(),
                created_at: now,
                last_seen: now,
            },
        })
        .unwrap();
    key
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn path_parameters_reach_the_verb() {
    let f = fixture();
    let response = f.app.clone().oneshot(get("/items/7?ignored=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-item"], "7");
    assert_eq!(
        response.headers()["content-type"],
        "application/json; charset=utf-8"
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let item: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(item, json!({"id": 7, "name": "widget"}));

    let requests = f.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["method"], "GET");
    assert_eq!(requests[0]["path"], "/items/7");
    assert_eq!(requests[0]["pathParameters"], json!({"id": "7"}));
    assert_eq!(requests[0]["body"], json!({}));
}

#[tokio::test]
async fn verbs_choose_the_status() {
    let f = fixture();
    let request = Request::builder()
        .method("POST")
        .uri("/items")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"id":1,"name":"bolt"}"#))
        .unwrap();
    let (status, _, body) = send(&f.app, request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        serde_json::from_str::<Json>(&body).unwrap(),
        json!({"id": 1, "name": "bolt"})
    );
    let requests = f.requests.lock().unwrap();
    assert_eq!(requests[0]["headers"]["Content-Type"], json!(["application/json"]));
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let f = fixture();
    let (status, _, body) = send(&f.app, get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "route not found");

    // Methods are part of the route.
    let request = Request::builder()
        .method("DELETE")
        .uri("/items")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&f.app, request).await.0, StatusCode::NOT_FOUND);
    assert!(f.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_bodies_are_rejected_before_the_call() {
    let f = fixture();
    let request = Request::builder()
        .method("POST")
        .uri("/items")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, content_type, body) = send(&f.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
    assert!(body.starts_with("HTTP request body is not valid JSON"), "{body}");
    assert!(f.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn runner_failures_hide_their_details() {
    let f = fixture();
    let (status, _, body) = send(&f.app, get("/broken")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Service Unavailable");
}

#[tokio::test(start_paused = true)]
async fn requests_are_recorded_on_the_timeline() {
    let f = fixture();
    send(&f.app, get("/items/3")).await;
    send(&f.app, get("/broken")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = f
        .timeline
        .get_timeline(&TimelineQuery::new(10).filter(TimelineFilter::Types {
            types: vec![EventType::Ingress],
        }))
        .unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event.deployment.as_ref(), Some(&f.deployment));
        assert!(event.request_key.is_some());
    }
    let summary: Vec<_> = events
        .iter()
        .map(|e| match &e.payload {
            EventPayload::Ingress {
                verb,
                method,
                path,
                status,
                error,
                ..
            } => (verb.clone(), method.clone(), path.clone(), *status, error.is_some()),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(
        summary,
        [
            (RefKey::new("shop", "get"), "GET".to_string(), "/items/3".to_string(), 200, false),
            (RefKey::new("shop", "broken"), "GET".to_string(), "/broken".to_string(), 503, true),
        ]
    );
}
