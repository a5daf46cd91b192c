//! Topics, subscriptions and their progression.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ftl_core::{Clock, DeploymentKey, RefKey, RequestKey};
use ftl_schema::{FromOffset, Module, RetryParams};
use ftl_scheduler::{Backoff, JobHandle, Scheduler};
use ftl_state::{
    ClusterEvent, ClusterState, ClusterView, NewTopicEvent, Progress, StateStore, SubscriptionRow,
    TopicEvent,
};
use ftl_timeline::{EventPayload, TimelineClient, TimelineEvent};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PubSubError, PubSubResult};

/// How often subscriptions are progressed when nothing nudges them.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// An event to publish, as sent by a runner.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub topic: RefKey,
    /// The verb that published it.
    pub caller: Option<RefKey>,
    pub body: Vec<u8>,
    pub request_key: Option<RequestKey>,
}

#[derive(Clone)]
pub struct PubSubService {
    state: ClusterState,
    timeline: TimelineClient,
    clock: Arc<dyn Clock>,
    consumption_delay: Duration,
    progress_job: Arc<OnceLock<JobHandle>>,
    pub(crate) executor_job: Arc<OnceLock<JobHandle>>,
}

impl PubSubService {
    /// `consumption_delay` is how old an event must be before it is
    /// delivered, so that events committed out of order are not skipped.
    pub fn new(
        state: ClusterState,
        timeline: TimelineClient,
        clock: Arc<dyn Clock>,
        consumption_delay: Duration,
    ) -> Self {
        Self {
            state,
            timeline,
            clock,
            consumption_delay,
            progress_job: Arc::new(OnceLock::new()),
            executor_job: Arc::new(OnceLock::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        self.state.store()
    }

    pub fn ping(&self) {}

    // ── Publishing ─────────────────────────────────────────────────

    /// Append an event to a topic of an active deployment. The attempt is
    /// recorded on the timeline whether or not it succeeds.
    pub fn publish_event(&self, event: PublishEvent) -> PubSubResult<TopicEvent> {
        let view = self.state.view();
        let result = self.append(&view, &event);

        let mut record = TimelineEvent::new(EventPayload::PubsubPublish {
            verb: event.caller.clone(),
            topic: event.topic.clone(),
            request: String::from_utf8_lossy(&event.body).into_owned(),
            error: result.as_ref().err().map(ToString::to_string),
        })
        .at(self.clock.now())
        .request(event.request_key.clone());
        if let Some(deployment) = view.active_deployment(&event.topic.module) {
            record = record.deployment(deployment.key.clone());
        }
        self.timeline.publish(record);

        match &result {
            Ok(stored) => {
                debug!(topic = %event.topic, seq = stored.seq, "event published");
                self.nudge_progress_after(self.consumption_delay);
            }
            Err(e) => warn!(topic = %event.topic, error = %e, "publish failed"),
        }
        result
    }

    fn append(&self, view: &ClusterView, event: &PublishEvent) -> PubSubResult<TopicEvent> {
        let declared = view
            .active_deployment(&event.topic.module)
            .is_some_and(|d| d.schema.topics().any(|t| t.name == event.topic.name));
        if !declared {
            return Err(PubSubError::NotFound(format!("topic {} not found", event.topic)));
        }
        let stored = self.store().publish_topic_event(
            &NewTopicEvent {
                topic: event.topic.clone(),
                payload: event.body.clone(),
                caller: event.caller.clone(),
                request_key: event.request_key.clone(),
                trace_context: None,
            },
            self.clock.now(),
        )?;
        Ok(stored)
    }

    /// Move a subscription's cursor to the head of its topic.
    pub fn reset_subscription(&self, subscription: &RefKey) -> PubSubResult<SubscriptionRow> {
        let row = self.store().reset_subscription(subscription)?;
        info!(%subscription, cursor = row.cursor, "subscription reset to head");
        Ok(row)
    }

    // ── Progression ────────────────────────────────────────────────

    /// Hand the next ready event of every lagging subscription to one of its
    /// subscribers. Returns the number of deliveries scheduled.
    pub fn progress_subscriptions(&self) -> PubSubResult<usize> {
        let store = self.store();
        let mut dispatched = 0;
        for subscription in store.subscriptions_with_backlog()? {
            let reference = subscription.reference();
            let now = self.clock.now();
            let progress = store.progress_subscription(
                &reference,
                now,
                self.consumption_delay,
                |count| rand::thread_rng().gen_range(0..count),
            );
            match progress {
                Ok(Progress::Dispatched {
                    event,
                    subscriber,
                    call_id,
                }) => {
                    debug!(
                        subscription = %reference,
                        seq = event.seq,
                        sink = %subscriber.sink,
                        call_id,
                        "event dispatched"
                    );
                    dispatched += 1;
                }
                Ok(Progress::NotReady) => {
                    debug!(subscription = %reference, "next event not ready yet");
                }
                Ok(Progress::NoSubscriber { event }) => {
                    let error = format!("no subscriber for subscription {reference}");
                    warn!(subscription = %reference, seq = event.seq, "{error}");
                    self.record_consume(&subscription, None, Some(error));
                }
                Ok(Progress::Locked | Progress::CaughtUp) => {}
                Err(e) => {
                    warn!(subscription = %reference, error = %e, "failed to progress subscription");
                    self.record_consume(&subscription, None, Some(e.to_string()));
                }
            }
        }
        if dispatched > 0 {
            self.async_call_added();
        }
        Ok(dispatched)
    }

    pub(crate) fn record_consume(
        &self,
        subscription: &SubscriptionRow,
        verb: Option<RefKey>,
        error: Option<String>,
    ) {
        let event = TimelineEvent::new(EventPayload::PubsubConsume {
            verb,
            topic: subscription.topic.clone(),
            subscription: subscription.reference(),
            error,
        })
        .at(self.clock.now())
        .deployment(subscription.deployment.clone());
        self.timeline.publish(event);
    }

    /// Run progression soon.
    pub fn nudge_progress(&self) {
        if let Some(job) = self.progress_job.get() {
            job.trigger();
        }
    }

    fn nudge_progress_after(&self, delay: Duration) {
        let Some(job) = self.progress_job.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.trigger();
        });
    }

    pub(crate) fn async_call_added(&self) {
        if let Some(job) = self.executor_job.get() {
            job.trigger();
        }
    }

    /// Progress subscriptions periodically and whenever an event is
    /// published, on one controller at a time.
    pub fn schedule(&self, scheduler: &Scheduler) -> JobHandle {
        let service = self.clone();
        let handle = scheduler.singleton(
            "progress-subscriptions",
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            move || {
                let service = service.clone();
                async move {
                    service.progress_subscriptions()?;
                    Ok(PROGRESS_INTERVAL)
                }
            },
        );
        let _ = self.progress_job.set(handle.clone());
        handle
    }

    // ── Deployment lifecycle ───────────────────────────────────────

    /// Create the topics, subscriptions and subscribers a deployment
    /// declares. Subscriptions that already exist keep their cursor.
    pub fn register_deployment(&self, key: &DeploymentKey) -> PubSubResult<()> {
        let view = self.state.view();
        let deployment = view
            .deployment(key)
            .ok_or_else(|| PubSubError::NotFound(format!("deployment {key} not found")))?;
        let module = &deployment.schema;
        let store = self.store();
        let now = self.clock.now();

        for topic in module.topics() {
            store.upsert_topic(&module.name, &topic.name, &topic.event.to_string())?;
        }
        for subscription in module.subscriptions() {
            store.upsert_subscription(
                &module.name,
                &subscription.name,
                &subscription.topic.key(),
                key,
                subscription_offset(module, &subscription.name),
                now,
            )?;
        }
        for verb in module.verbs() {
            for subscriber in verb.subscribers() {
                let retry = match verb.retry() {
                    Some(retry) => retry.retry_params().map_err(|e| {
                        PubSubError::InvalidArgument(format!("verb {}.{}: {e}", module.name, verb.name))
                    })?,
                    None => RetryParams::default(),
                };
                store.upsert_subscriber(
                    &RefKey::new(&module.name, &subscriber.name),
                    key,
                    &RefKey::new(&module.name, &verb.name),
                    retry,
                )?;
            }
        }
        info!(deployment = %key, "subscriptions registered");
        Ok(())
    }

    /// Remove what a deployment registered and still owns.
    pub fn unregister_deployment(&self, key: &DeploymentKey) -> PubSubResult<usize> {
        let removed = self.store().delete_subscriptions_for_deployment(key)?;
        info!(deployment = %key, removed, "subscriptions removed");
        Ok(removed)
    }

    /// Follow activations and deactivations until shutdown. Every active
    /// deployment is registered first.
    pub fn spawn_deployment_watcher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self.clone();
        let (view, mut events) = self.state.subscribe_with_view();
        tokio::spawn(async move {
            service.register_active(&view);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ClusterEvent::DeploymentActivated { key, .. }) => {
                            if let Err(e) = service.register_deployment(&key) {
                                warn!(deployment = %key, error = %e, "failed to register subscriptions");
                            }
                        }
                        Some(ClusterEvent::DeploymentDeactivated { key, .. }) => {
                            if let Err(e) = service.unregister_deployment(&key) {
                                warn!(deployment = %key, error = %e, "failed to remove subscriptions");
                            }
                        }
                        Some(_) => {}
                        None => {
                            let (view, resubscribed) = service.state.subscribe_with_view();
                            events = resubscribed;
                            service.register_active(&view);
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("pubsub deployment watcher stopped");
        })
    }

    fn register_active(&self, view: &ClusterView) {
        for deployment in view.active_deployments() {
            if let Err(e) = self.register_deployment(&deployment.key) {
                warn!(deployment = %deployment.key, error = %e, "failed to register subscriptions");
            }
        }
    }
}

/// Where a new subscription starts, as declared by its subscribers.
fn subscription_offset(module: &Module, subscription: &str) -> FromOffset {
    module
        .verbs()
        .flat_map(|verb| verb.subscribers())
        .find(|subscriber| subscriber.name == subscription)
        .map_or(FromOffset::Beginning, |subscriber| subscriber.from)
}
