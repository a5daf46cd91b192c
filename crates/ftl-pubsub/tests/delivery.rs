//! Subscription delivery through the async executor, against fake runners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ftl_core::{Clock, Code, DeploymentKey, ErrorCode, ManualClock, RefKey, RunnerKey};
use ftl_dispatch::{
    ClientCache, ClientFactory, DispatchError, DispatchResult, Dispatcher, VerbClient, VerbRequest,
};
use ftl_pubsub::{AsyncExecutor, LEASE_EXPIRED, PubSubService, PublishEvent};
use ftl_routing::RouteTable;
use ftl_state::{AsyncCallState, AsyncOrigin, ClusterEvent, ClusterState, Deployment, Runner, StateStore};
use ftl_timeline::{
    EventPayload, EventType, InMemoryTimeline, TimelineClient, TimelineFilter, TimelineQuery,
};
use serde_json::{Value, json};
use tokio::sync::watch;

/// A runner whose `shop.audit` fails a set number of times before working.
#[derive(Default)]
struct FlakyRunner {
    failures_left: AtomicUsize,
    calls: Mutex<Vec<VerbRequest>>,
}

struct Client(Arc<FlakyRunner>);

#[async_trait]
impl VerbClient for Client {
    async fn call(&self, request: VerbRequest) -> DispatchResult<Vec<u8>> {
        let fail = request.verb == RefKey::new("shop", "audit")
            && self
                .0
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        self.0.calls.lock().unwrap().push(request);
        if fail {
            Err(DispatchError::Verb("boom".to_string()))
        } else {
            Ok(b"{}".to_vec())
        }
    }
}

struct Fixture {
    state: ClusterState,
    clock: Arc<ManualClock>,
    pubsub: PubSubService,
    executor: AsyncExecutor,
    runner: Arc<FlakyRunner>,
    timeline: Arc<InMemoryTimeline>,
    _shutdown: watch::Sender<bool>,
}

impl Fixture {
    fn calls_to(&self, verb: &str) -> Vec<VerbRequest> {
        let verb: RefKey = verb.parse().unwrap();
        self.runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.verb == verb)
            .cloned()
            .collect()
    }

    fn publish(&self, body: Value) {
        self.pubsub
            .publish_event(PublishEvent {
                topic: RefKey::new("shop", "orders"),
                caller: Some(RefKey::new("shop", "place")),
                body: serde_json::to_vec(&body).unwrap(),
                request_key: None,
            })
            .unwrap();
    }

    fn advance(&self, millis: u64) {
        self.clock.advance(Duration::from_millis(millis));
    }

    fn cursor(&self) -> u64 {
        self.pubsub
            .store()
            .get_subscription(&RefKey::new("shop", "audit"))
            .unwrap()
            .unwrap()
            .cursor
    }
}

fn schema(retry: &str) -> String {
    format!(
        r#"module shop {{
  export topic orders shop.Order

  subscription audit shop.orders

  export data Order {{
    id Int
  }}

  verb place(Unit) Unit
    +publish shop.orders

  verb audit(shop.Order) Unit
    +subscribe audit
    +retry {retry}

  verb recover(builtin.CatchRequest<shop.Order>) Unit
}}
"#
    )
}

fn fixture(retry: &str, failures: usize) -> Fixture {
    let store = StateStore::open_in_memory().unwrap();
    let state = ClusterState::open(store).unwrap();
    let (shutdown, rx) = watch::channel(false);
    let timeline = Arc::new(InMemoryTimeline::new());
    let (client, _) = TimelineClient::spawn(timeline.clone(), rx);
    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));

    let runner = Arc::new(FlakyRunner {
        failures_left: AtomicUsize::new(failures),
        calls: Mutex::default(),
    });
    let shared = Arc::clone(&runner);
    let factory: ClientFactory =
        Arc::new(move |_: &str| Arc::new(Client(Arc::clone(&shared))) as Arc<dyn VerbClient>);
    let dispatcher = Dispatcher::new(
        RouteTable::new(state.clone()),
        Arc::new(ClientCache::new(Duration::from_secs(60), factory)),
        client.clone(),
        clock.clone(),
    );
    let pubsub = PubSubService::new(
        state.clone(),
        client.clone(),
        clock.clone(),
        Duration::from_millis(100),
    );
    let executor = AsyncExecutor::new(dispatcher, pubsub.clone(), client, clock.clone());

    let key = deploy(&state, &schema(retry), clock.now());
    pubsub.register_deployment(&key).unwrap();
    Fixture {
        state,
        clock,
        pubsub,
        executor,
        runner,
        timeline,
        _shutdown: shutdown,
    }
}

fn deploy(state: &ClusterState, src: &str, at: chrono::DateTime<Utc>) -> DeploymentKey {
    let schema = ftl_schema::parse_module_string("shop.ftl", src).unwrap();
    let deployment = Deployment {
        key: DeploymentKey::new(&schema.name),
        module: schema.name.clone(),
        schema,
        language: "go".to_string(),
        artefacts: Vec::new(),
        created_at: at,
        activated_at: None,
        min_replicas: 0,
    };
    let key = deployment.key.clone();
    state
        .publish(ClusterEvent::DeploymentCreated {
            deployment: Box::new(deployment.clone()),
        })
        .unwrap();
    state
        .publish(ClusterEvent::DeploymentActivated {
            key: key.clone(),
            activated_at: at,
            min_replicas: 1,
        })
        .unwrap();
    state
        .publish(ClusterEvent::RunnerRegistered {
            runner: Runner {
                key: RunnerKey::new("localhost", 9100),
                endpoint: "http://localhost:9100".to_string(),
                deployment: key.clone(),
                module: deployment.module,
                created_at: at,
                last_seen: at,
            },
        })
        .unwrap();
    key
}

async fn consume_events(timeline: &InMemoryTimeline) -> Vec<Option<String>> {
    tokio::time::sleep(Duration::from_secs(1)).await;
    timeline
        .get_timeline(&TimelineQuery::new(100).filter(TimelineFilter::Types {
            types: vec![EventType::PubsubConsume],
        }))
        .unwrap()
        .into_iter()
        .map(|e| match e.payload {
            EventPayload::PubsubConsume { error, .. } => error,
            other => panic!("unexpected {other:?}"),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn deliveries_are_retried_in_topic_order() {
    let f = fixture("2 1s catch shop.recover", 2);
    f.publish(json!({"id": 1}));
    f.advance(1);
    f.publish(json!({"id": 2}));

    // Neither event is older than the consumption delay yet.
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 0);
    f.advance(200);

    // Only the first event is in flight until its delivery finishes.
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 1);
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 0);
    assert_eq!(f.cursor(), 1);

    let first = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(first.state, AsyncCallState::Error);
    assert!(f.executor.execute_next().await.unwrap().is_none());

    f.advance(1_000);
    let second = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(second.state, AsyncCallState::Error);
    assert_eq!(second.remaining_attempts, 1);
    assert_eq!(second.backoff, Duration::from_secs(2));

    f.advance(1_000);
    assert!(f.executor.execute_next().await.unwrap().is_none());
    f.advance(1_000);
    let third = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(third.state, AsyncCallState::Success);
    assert_eq!(third.remaining_attempts, 0);

    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 1);
    assert_eq!(f.cursor(), 2);
    let last = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(last.state, AsyncCallState::Success);
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 0);

    let deliveries: Vec<Value> = f
        .calls_to("shop.audit")
        .iter()
        .map(|c| serde_json::from_slice(&c.body).unwrap())
        .collect();
    assert_eq!(
        deliveries,
        [json!({"id": 1}), json!({"id": 1}), json!({"id": 1}), json!({"id": 2})]
    );
    assert!(f.calls_to("shop.recover").is_empty());

    let origin = AsyncOrigin::PubSub(RefKey::new("shop", "audit"));
    let attempts = f.pubsub.store().async_calls_for_origin(&origin).unwrap();
    assert_eq!(attempts.len(), 4);

    let consumed = consume_events(&f.timeline).await;
    assert_eq!(
        consumed,
        [Some("boom".to_string()), Some("boom".to_string()), None, None]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_deliveries_are_caught() {
    let f = fixture("1 1s catch shop.recover", usize::MAX);
    f.publish(json!({"id": 7}));
    f.advance(200);
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 1);

    f.executor.execute_next().await.unwrap().unwrap();
    f.advance(1_000);
    let exhausted = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(exhausted.remaining_attempts, 0);

    let caught = f.executor.execute_next().await.unwrap().unwrap();
    assert!(caught.catching);
    assert_eq!(caught.verb, RefKey::new("shop", "recover"));
    assert_eq!(caught.state, AsyncCallState::Success);

    let recover = f.calls_to("shop.recover");
    assert_eq!(recover.len(), 1);
    let body: Value = serde_json::from_slice(&recover[0].body).unwrap();
    assert_eq!(
        body,
        json!({
            "verb": {"module": "shop", "name": "audit"},
            "requestType": "shop.Order",
            "request": {"id": 7},
            "error": "boom",
        })
    );

    // The event is done with; nothing more is delivered.
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 0);
    assert!(f.executor.execute_next().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_deliveries_without_a_catch_are_dead_lettered() {
    let f = fixture("1 1s", usize::MAX);
    f.publish(json!({"id": 1}));
    f.advance(1);
    f.publish(json!({"id": 2}));
    f.advance(200);

    f.pubsub.progress_subscriptions().unwrap();
    f.executor.execute_next().await.unwrap().unwrap();
    f.advance(1_000);
    let last = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(last.state, AsyncCallState::Error);

    // The subscription moves on to the second event.
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 1);
    assert_eq!(f.cursor(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_leases_are_failed_and_retried() {
    let f = fixture("2 1s", 0);
    f.publish(json!({"id": 1}));
    f.advance(200);
    f.pubsub.progress_subscriptions().unwrap();

    // An executor takes the call and never finishes it.
    let taken = f
        .pubsub
        .store()
        .acquire_async_call(f.clock.now(), Duration::from_secs(60))
        .unwrap()
        .unwrap();
    assert_eq!(f.executor.reap_zombies().unwrap(), 0);

    f.advance(61_000);
    assert_eq!(f.executor.reap_zombies().unwrap(), 1);
    let reaped = f.pubsub.store().get_async_call(taken.id).unwrap().unwrap();
    assert_eq!(reaped.state, AsyncCallState::Error);
    assert_eq!(reaped.error.as_deref(), Some(LEASE_EXPIRED));

    f.advance(1_000);
    let retried = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(retried.state, AsyncCallState::Success);
    assert_eq!(f.calls_to("shop.audit").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn publishing_needs_a_declared_topic() {
    let f = fixture("2 1s", 0);
    let err = f
        .pubsub
        .publish_event(PublishEvent {
            topic: RefKey::new("shop", "missing"),
            caller: None,
            body: b"{}".to_vec(),
            request_key: None,
        })
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.to_string(), "topic shop.missing not found");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let published = f
        .timeline
        .get_timeline(&TimelineQuery::new(10).filter(TimelineFilter::Types {
            types: vec![EventType::PubsubPublish],
        }))
        .unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload.error(), Some("topic shop.missing not found"));
}

#[tokio::test(start_paused = true)]
async fn reset_moves_the_cursor_to_the_head() {
    let f = fixture("2 1s", 0);
    let subscription = RefKey::new("shop", "audit");
    let err = f.pubsub.reset_subscription(&subscription).unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(err.to_string(), "no events published to topic orders");

    f.publish(json!({"id": 1}));
    f.publish(json!({"id": 2}));
    let row = f.pubsub.reset_subscription(&subscription).unwrap();
    assert_eq!(row.cursor, 2);
    f.advance(200);
    assert_eq!(f.pubsub.progress_subscriptions().unwrap(), 0);

    let err = f
        .pubsub
        .reset_subscription(&RefKey::new("shop", "nope"))
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test(start_paused = true)]
async fn replacing_a_deployment_keeps_the_cursor() {
    let f = fixture("2 1s", 0);
    f.publish(json!({"id": 1}));
    f.advance(200);
    f.pubsub.progress_subscriptions().unwrap();
    f.executor.execute_next().await.unwrap().unwrap();

    let old = f.state.view().active_deployment("shop").unwrap().key.clone();
    let new = deploy(&f.state, &schema("2 1s"), f.clock.now());
    f.pubsub.register_deployment(&new).unwrap();
    f.state
        .publish(ClusterEvent::DeploymentDeactivated {
            key: old.clone(),
            module_removed: false,
        })
        .unwrap();
    assert_eq!(f.pubsub.unregister_deployment(&old).unwrap(), 0);

    let row = f
        .pubsub
        .store()
        .get_subscription(&RefKey::new("shop", "audit"))
        .unwrap()
        .unwrap();
    assert_eq!(row.deployment, new);
    assert_eq!(row.cursor, 1);
    assert_eq!(
        f.pubsub
            .store()
            .subscribers_for(&RefKey::new("shop", "audit"))
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn the_watcher_follows_activations() {
    let f = fixture("2 1s", 0);
    let (tx, rx) = watch::channel(false);
    let watcher = f.pubsub.spawn_deployment_watcher(rx);

    let old = f.state.view().active_deployment("shop").unwrap().key.clone();
    f.state
        .publish(ClusterEvent::DeploymentDeactivated {
            key: old,
            module_removed: true,
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.pubsub.store().list_subscriptions().unwrap().is_empty());

    tx.send(true).unwrap();
    watcher.await.unwrap();
}
