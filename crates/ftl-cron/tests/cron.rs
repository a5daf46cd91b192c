//! Cron jobs fired through the async executor against a fake runner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ftl_core::{Clock, Code, CronJobKey, DeploymentKey, ErrorCode, ManualClock, RefKey, RunnerKey};
use ftl_cron::CronService;
use ftl_dispatch::{ClientCache, ClientFactory, DispatchResult, Dispatcher, VerbClient, VerbRequest};
use ftl_pubsub::{AsyncExecutor, PubSubService};
use ftl_routing::RouteTable;
use ftl_state::{
    AsyncCallState, AsyncOrigin, ClusterEvent, ClusterState, CronJob, Deployment, Runner,
    StateStore,
};
use ftl_timeline::{
    EventPayload, EventType, InMemoryTimeline, TimelineClient, TimelineFilter, TimelineQuery,
};
use tokio::sync::watch;

const SCHEMA: &str = "module echo {\n  verb tick(Unit) Unit\n    +cron */5 * * * * *\n\n  verb plain(Unit) Unit\n}\n";

type Calls = Arc<Mutex<Vec<RefKey>>>;

struct Recorder(Calls);

#[async_trait]
impl VerbClient for Recorder {
    async fn call(&self, request: VerbRequest) -> DispatchResult<Vec<u8>> {
        self.0.lock().unwrap().push(request.verb);
        Ok(b"{}".to_vec())
    }
}

struct Fixture {
    state: ClusterState,
    clock: Arc<ManualClock>,
    cron: CronService,
    executor: AsyncExecutor,
    calls: Calls,
    timeline: Arc<InMemoryTimeline>,
    deployment: DeploymentKey,
    _shutdown: watch::Sender<bool>,
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn fixture() -> Fixture {
    let state = ClusterState::open(StateStore::open_in_memory().unwrap()).unwrap();
    let (shutdown, rx) = watch::channel(false);
    let timeline = Arc::new(InMemoryTimeline::new());
    let (client, _) = TimelineClient::spawn(timeline.clone(), rx);
    let clock = Arc::new(ManualClock::new(t(0)));

    let calls: Calls = Arc::default();
    let recorded = Arc::clone(&calls);
    let factory: ClientFactory =
        Arc::new(move |_: &str| Arc::new(Recorder(Arc::clone(&recorded))) as Arc<dyn VerbClient>);
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
    let cron = CronService::new(state.clone(), client.clone(), clock.clone());
    let executor = AsyncExecutor::new(dispatcher, pubsub, client, clock.clone())
        .with_cron(Arc::new(cron.clone()));

    let deployment = deploy(&state);
    Fixture {
        state,
        clock,
        cron,
        executor,
        calls,
        timeline,
        deployment,
        _shutdown: shutdown,
    }
}

fn deploy(state: &ClusterState) -> DeploymentKey {
    let schema = ftl_schema::parse_module_string("echo.ftl", SCHEMA).unwrap();
    let deployment = Deployment {
        key: DeploymentKey::new("echo"),
        module: "echo".to_string(),
        schema,
        language: "go".to_string(),
        artefacts: Vec::new(),
        created_at: t(0),
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
            activated_at: t(0),
            min_replicas: 1,
        })
        .unwrap();
    state
        .publish(ClusterEvent::RunnerRegistered {
            runner: Runner {
                key: RunnerKey::new("localhost", 9200),
                endpoint: "http://localhost:9200".to_string(),
                deployment: key.clone(),
                module: "echo".to_string(),
                created_at: t(0),
                last_seen: t(0),
            },
        })
        .unwrap();
    key
}

fn pending_firings(f: &Fixture, job: &CronJobKey) -> Vec<DateTime<Utc>> {
    f.cron
        .store()
        .async_calls_for_origin(&AsyncOrigin::Cron(job.clone()))
        .unwrap()
        .into_iter()
        .filter(|call| call.state == AsyncCallState::Pending)
        .map(|call| call.scheduled_at)
        .collect()
}

async fn scheduled_events(timeline: &InMemoryTimeline) -> Vec<(DateTime<Utc>, Option<String>)> {
    tokio::time::sleep(Duration::from_secs(1)).await;
    timeline
        .get_timeline(&TimelineQuery::new(20).filter(TimelineFilter::Types {
            types: vec![EventType::CronScheduled],
        }))
        .unwrap()
        .into_iter()
        .map(|e| match e.payload {
            EventPayload::CronScheduled {
                scheduled_at, error, ..
            } => (scheduled_at, error),
            other => panic!("unexpected {other:?}"),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn activation_creates_and_schedules_jobs() {
    let f = fixture();
    let jobs = f.cron.create_jobs(&f.deployment).unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.verb, RefKey::new("echo", "tick"));
    assert_eq!(job.schedule, "*/5 * * * * *");
    assert_eq!(job.start_time, t(0));
    assert_eq!(job.next_execution, t(5));
    assert!(job.last_async_call.is_some());
    assert_eq!(pending_firings(&f, &job.key), [t(5)]);

    // Creating again neither duplicates the job nor its firing.
    let again = f.cron.create_jobs(&f.deployment).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].key, job.key);
    assert_eq!(pending_firings(&f, &job.key), [t(5)]);

    assert_eq!(scheduled_events(&f.timeline).await, [(t(5), None)]);
}

#[tokio::test(start_paused = true)]
async fn finished_firings_schedule_the_next() {
    let f = fixture();
    let key = f.cron.create_jobs(&f.deployment).unwrap()[0].key.clone();

    assert!(f.executor.execute_next().await.unwrap().is_none());
    f.clock.advance(Duration::from_secs(5));
    let fired = f.executor.execute_next().await.unwrap().unwrap();
    assert_eq!(fired.state, AsyncCallState::Success);
    assert_eq!(*f.calls.lock().unwrap(), [RefKey::new("echo", "tick")]);

    let job = f.cron.store().get_cron_job(&key).unwrap().unwrap();
    assert_eq!(job.last_execution, Some(t(5)));
    assert_eq!(job.next_execution, t(10));
    assert_eq!(pending_firings(&f, &key), [t(10)]);
}

#[tokio::test(start_paused = true)]
async fn firings_carry_no_retries() {
    let f = fixture();
    let key = f.cron.create_jobs(&f.deployment).unwrap()[0].key.clone();
    let calls = f
        .cron
        .store()
        .async_calls_for_origin(&AsyncOrigin::Cron(key))
        .unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].remaining_attempts, 0);
    assert_eq!(calls[0].backoff, Duration::ZERO);
    assert!(calls[0].catch_verb.is_none());
}

#[tokio::test(start_paused = true)]
async fn missed_firings_are_not_scheduled_in_the_past() {
    let f = fixture();
    let key = f.cron.create_jobs(&f.deployment).unwrap()[0].key.clone();

    f.clock.advance(Duration::from_secs(60));
    f.executor.execute_next().await.unwrap().unwrap();

    let job = f.cron.store().get_cron_job(&key).unwrap().unwrap();
    assert_eq!(job.next_execution, f.clock.now());
    assert_eq!(pending_firings(&f, &key), [t(60)]);
}

#[tokio::test(start_paused = true)]
async fn the_rescan_skips_pending_jobs() {
    let f = fixture();
    f.cron.create_jobs(&f.deployment).unwrap();
    assert_eq!(f.cron.schedule_all().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn unparsable_schedules_are_recorded() {
    let f = fixture();
    let job = CronJob {
        key: CronJobKey::new("echo", "plain"),
        deployment: f.deployment.clone(),
        verb: RefKey::new("echo", "plain"),
        schedule: "not a cron".to_string(),
        start_time: t(0),
        next_execution: t(0),
        last_execution: None,
        last_async_call: None,
    };
    f.cron.store().put_cron_job(&job).unwrap();

    let err = f.cron.schedule_job(&job, None).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(pending_firings(&f, &job.key).is_empty());

    let events = scheduled_events(&f.timeline).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, t(0));
    assert!(events[0].1.is_some());
}

#[tokio::test(start_paused = true)]
async fn the_watcher_follows_the_deployment() {
    let f = fixture();
    let (tx, rx) = watch::channel(false);
    let watcher = f.cron.spawn_deployment_watcher(rx);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let jobs = f.cron.store().cron_jobs_for_deployment(&f.deployment).unwrap();
    assert_eq!(jobs.len(), 1);

    f.state
        .publish(ClusterEvent::DeploymentDeactivated {
            key: f.deployment.clone(),
            module_removed: true,
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.cron.store().list_cron_jobs().unwrap().is_empty());

    // The firing already scheduled runs, and nothing follows it.
    f.clock.advance(Duration::from_secs(5));
    assert!(f.cron.job_finished(&jobs[0].key).unwrap().is_none());

    tx.send(true).unwrap();
    watcher.await.unwrap();
}
