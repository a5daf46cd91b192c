//! The async call executor.
//!
//! Each attempt of an async call is one row. A failed attempt with attempts
//! remaining schedules a new row after its backoff, doubling the backoff up
//! to the maximum. Once attempts run out, a call with a catch verb gets a
//! catching row that invokes the catch verb with a `CatchRequest`; a failed
//! catch is retried once. When a call is finished for good, its origin is
//! told: subscriptions move on to their next event and cron jobs schedule
//! their next firing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_core::{Clock, CronJobKey, Origin, RequestKey};
use ftl_dispatch::{CallContext, CallRequest, Dispatcher};
use ftl_scheduler::{Backoff, JobHandle, Scheduler};
use ftl_state::{AsyncCall, AsyncCallState, AsyncOrigin, NewAsyncCall, StateStore};
use ftl_timeline::{AsyncEventType, EventPayload, TimelineClient, TimelineEvent};
use serde_json::{Value as Json, json};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::PubSubResult;
use crate::service::PubSubService;

/// How long an executing call may run before the reaper fails it.
pub const DEFAULT_CALL_LEASE: Duration = Duration::from_secs(60);

/// Error recorded on calls whose lease ran out.
pub const LEASE_EXPIRED: &str = "async call lease expired";

const ZOMBIE_BATCH: usize = 20;
const MAX_CALLS_PER_RUN: usize = 32;
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Told when a cron call is finished for good, successfully or not.
pub trait CronCompletion: Send + Sync + 'static {
    fn cron_call_finished(&self, job: &CronJobKey, call: &AsyncCall) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct AsyncExecutor {
    dispatcher: Dispatcher,
    pubsub: PubSubService,
    timeline: TimelineClient,
    clock: Arc<dyn Clock>,
    lease: Duration,
    cron: Option<Arc<dyn CronCompletion>>,
}

impl AsyncExecutor {
    pub fn new(
        dispatcher: Dispatcher,
        pubsub: PubSubService,
        timeline: TimelineClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            pubsub,
            timeline,
            clock,
            lease: DEFAULT_CALL_LEASE,
            cron: None,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_cron(mut self, cron: Arc<dyn CronCompletion>) -> Self {
        self.cron = Some(cron);
        self
    }

    fn store(&self) -> &StateStore {
        self.pubsub.store()
    }

    /// Execute the earliest call that is due, if any. Returns the finished
    /// attempt.
    pub async fn execute_next(&self) -> PubSubResult<Option<AsyncCall>> {
        let Some(call) = self.store().acquire_async_call(self.clock.now(), self.lease)? else {
            return Ok(None);
        };
        let span = info_span!("async_call", id = call.id, verb = %call.verb, origin = %call.origin);
        self.execute(call).instrument(span).await.map(Some)
    }

    /// Execute due calls until none is left or `limit` were run.
    pub async fn execute_due(&self, limit: usize) -> PubSubResult<usize> {
        let mut executed = 0;
        while executed < limit {
            if self.execute_next().await?.is_none() {
                break;
            }
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute(&self, call: AsyncCall) -> PubSubResult<AsyncCall> {
        let context = CallContext {
            request_key: Some(request_key(&call.origin)),
            parent_request_key: call.parent_request_key.clone(),
            ..CallContext::default()
        };
        let result = self
            .dispatcher
            .call(CallRequest::new(call.verb.clone(), call.request.clone()), context)
            .await;
        let outcome = match result {
            Ok(response) => {
                debug!("async call succeeded");
                Ok(response)
            }
            Err(e) => {
                warn!(error = %e, "async call failed");
                Err(e.to_string())
            }
        };
        let finished = self.store().complete_async_call(call.id, outcome)?;
        self.record(&finished);
        self.after_attempt(&finished)?;
        Ok(finished)
    }

    /// Fail executing calls whose lease ran out, in batches. Returns how
    /// many were failed.
    pub fn reap_zombies(&self) -> PubSubResult<usize> {
        let calls = self.store().expired_async_calls(self.clock.now(), ZOMBIE_BATCH)?;
        for call in &calls {
            warn!(id = call.id, verb = %call.verb, origin = %call.origin, "{LEASE_EXPIRED}");
            let finished = self
                .store()
                .complete_async_call(call.id, Err(LEASE_EXPIRED.to_string()))?;
            self.record(&finished);
            self.after_attempt(&finished)?;
        }
        Ok(calls.len())
    }

    /// How long until the next pending call is due.
    pub fn next_delay(&self) -> PubSubResult<Duration> {
        let Some(due) = self.store().next_async_call_due()? else {
            return Ok(IDLE_POLL);
        };
        let wait = (due - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        Ok(wait.clamp(Duration::from_millis(1), IDLE_POLL))
    }

    /// Schedule the executor and the zombie reaper.
    pub fn schedule(&self, scheduler: &Scheduler) -> (JobHandle, JobHandle) {
        let executor = self.clone();
        let execute = scheduler.parallel(
            "execute-async-calls",
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            move || {
                let executor = executor.clone();
                async move {
                    executor.execute_due(MAX_CALLS_PER_RUN).await?;
                    Ok(executor.next_delay()?)
                }
            },
        );
        let _ = self.pubsub.executor_job.set(execute.clone());

        let executor = self.clone();
        let reap = scheduler.singleton(
            "reap-async-calls",
            Backoff::new(Duration::from_secs(1), Duration::from_secs(5)),
            move || {
                let executor = executor.clone();
                async move {
                    let reaped = executor.reap_zombies()?;
                    Ok(if reaped == ZOMBIE_BATCH {
                        Duration::from_millis(1)
                    } else {
                        Duration::from_secs(5)
                    })
                }
            },
        );
        (execute, reap)
    }

    // ── Outcomes ───────────────────────────────────────────────────

    fn after_attempt(&self, call: &AsyncCall) -> PubSubResult<()> {
        if call.state == AsyncCallState::Success {
            return self.finish(call, None);
        }
        let error = call.error.clone().unwrap_or_else(|| "unknown error".to_string());
        let now = self.clock.now();

        if call.remaining_attempts > 0 {
            let backoff = if call.catching {
                call.backoff
            } else {
                call.backoff.saturating_mul(2).min(call.max_backoff)
            };
            let retry = NewAsyncCall {
                scheduled_at: later(now, call.backoff),
                remaining_attempts: call.remaining_attempts - 1,
                backoff,
                ..next_attempt(call)
            };
            let created = self.store().create_async_call(&retry, now)?;
            info!(
                id = created.id,
                remaining = created.remaining_attempts,
                scheduled_at = %created.scheduled_at,
                "async call retry scheduled"
            );
            return Ok(());
        }

        if !call.catching {
            if let Some(catch) = &call.catch_verb {
                match self.catch_request(call, &error) {
                    Ok(body) => {
                        let catching = NewAsyncCall {
                            scheduled_at: now,
                            verb: catch.clone(),
                            request: body,
                            remaining_attempts: 1,
                            catching: true,
                            ..next_attempt(call)
                        };
                        let created = self.store().create_async_call(&catching, now)?;
                        info!(id = created.id, %catch, "async call failed, catching");
                        return Ok(());
                    }
                    Err(e) => warn!(%catch, error = %e, "could not build catch request"),
                }
            }
        }
        self.finish(call, Some(error))
    }

    /// The body sent to a catch verb.
    fn catch_request(&self, call: &AsyncCall, error: &str) -> Result<Vec<u8>, String> {
        let routes = self.dispatcher.routes().current();
        let verb = routes
            .schema()
            .resolve_verb(&call.verb)
            .ok_or_else(|| format!("could not resolve original verb {}", call.verb))?;
        let request: Json = if call.request.is_empty() {
            json!({})
        } else {
            serde_json::from_slice(&call.request).map_err(|e| e.to_string())?
        };
        let body = json!({
            "verb": {"module": call.verb.module, "name": call.verb.name},
            "requestType": verb.request.to_string(),
            "request": request,
            "error": error,
        });
        serde_json::to_vec(&body).map_err(|e| e.to_string())
    }

    fn finish(&self, call: &AsyncCall, error: Option<String>) -> PubSubResult<()> {
        match &call.origin {
            AsyncOrigin::PubSub(subscription) => {
                if let Some(error) = &error {
                    warn!(%subscription, verb = %call.verb, error, "delivery failed, event dead-lettered");
                }
                self.store().complete_subscription_event(subscription)?;
                self.pubsub.nudge_progress();
            }
            AsyncOrigin::Cron(job) => {
                if let Some(cron) = &self.cron {
                    if let Err(e) = cron.cron_call_finished(job, call) {
                        warn!(%job, error = %e, "failed to schedule next cron firing");
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&self, call: &AsyncCall) {
        let deployment = self.dispatcher.routes().get_for_module(&call.verb.module);
        let event_type = match &call.origin {
            AsyncOrigin::Cron(_) => AsyncEventType::Cron,
            AsyncOrigin::PubSub(_) => AsyncEventType::Pubsub,
        };
        let mut event = TimelineEvent::new(EventPayload::AsyncExecute {
            verb: call.verb.clone(),
            async_event_type: event_type,
            error: call.error.clone(),
        })
        .at(self.clock.now())
        .request(call.parent_request_key.clone());
        if let Some(route) = &deployment {
            event = event.deployment(route.deployment.clone());
        }
        self.timeline.publish(event);

        if let AsyncOrigin::PubSub(subscription) = &call.origin {
            match self.store().get_subscription(subscription) {
                Ok(Some(row)) => {
                    self.pubsub
                        .record_consume(&row, Some(call.verb.clone()), call.error.clone());
                }
                Ok(None) => debug!(%subscription, "subscription gone, consume not recorded"),
                Err(e) => warn!(%subscription, error = %e, "failed to load subscription"),
            }
        }
    }
}

fn request_key(origin: &AsyncOrigin) -> RequestKey {
    match origin {
        AsyncOrigin::Cron(job) => RequestKey::new(Origin::Cron, &job.to_string()),
        AsyncOrigin::PubSub(subscription) => {
            RequestKey::new(Origin::PubSub, &subscription.to_string())
        }
    }
}

fn next_attempt(call: &AsyncCall) -> NewAsyncCall {
    NewAsyncCall {
        scheduled_at: call.scheduled_at,
        verb: call.verb.clone(),
        origin: call.origin.clone(),
        request: call.request.clone(),
        remaining_attempts: call.remaining_attempts,
        backoff: call.backoff,
        max_backoff: call.max_backoff,
        catch_verb: call.catch_verb.clone(),
        catching: call.catching,
        parent_request_key: call.parent_request_key.clone(),
        trace_context: call.trace_context.clone(),
    }
}

fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}
