//! Cron jobs: created on activation, fired as async calls, rescheduled on
//! completion.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_core::{Clock, CronJobKey, DeploymentKey, RefKey};
use ftl_pubsub::CronCompletion;
use ftl_scheduler::{Backoff, JobHandle, Scheduler};
use ftl_state::{
    AsyncCall, AsyncCallState, AsyncOrigin, ClusterEvent, ClusterState, ClusterView, CronJob,
    NewAsyncCall, StateStore,
};
use ftl_timeline::{EventPayload, TimelineClient, TimelineEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CronError, CronResult};

/// How often every job is checked for a missing next firing.
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Cron verbs take no input.
const CRON_REQUEST: &[u8] = b"{}";

#[derive(Clone)]
pub struct CronService {
    state: ClusterState,
    timeline: TimelineClient,
    clock: Arc<dyn Clock>,
}

impl CronService {
    pub fn new(state: ClusterState, timeline: TimelineClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            state,
            timeline,
            clock,
        }
    }

    pub fn store(&self) -> &StateStore {
        self.state.store()
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Create a job for each cron verb of a deployment and schedule its
    /// first firing. Jobs that already exist for the deployment are kept.
    /// Returns the deployment's jobs.
    pub fn create_jobs(&self, key: &DeploymentKey) -> CronResult<Vec<CronJob>> {
        let view = self.state.view();
        let deployment = view
            .deployment(key)
            .ok_or_else(|| CronError::NotFound(format!("deployment {key} not found")))?;
        let store = self.store();
        let existing: BTreeSet<RefKey> = store
            .cron_jobs_for_deployment(key)?
            .into_iter()
            .map(|job| job.verb)
            .collect();

        let module = &deployment.schema;
        let start = self.clock.now();
        let mut created = 0;
        for verb in module.verbs() {
            let Some(cron) = verb.cron() else {
                continue;
            };
            let reference = RefKey::new(&module.name, &verb.name);
            if existing.contains(&reference) {
                continue;
            }
            let job = CronJob {
                key: CronJobKey::new(&module.name, &verb.name),
                deployment: key.clone(),
                verb: reference,
                schedule: cron.cron.clone(),
                start_time: start,
                next_execution: next_firing(&cron.cron, start)?,
                last_execution: None,
                last_async_call: None,
            };
            store.put_cron_job(&job)?;
            created += 1;
        }
        if created > 0 {
            info!(deployment = %key, created, "cron jobs created");
        }

        let mut jobs = Vec::new();
        for job in store.cron_jobs_for_deployment(key)? {
            let ran = job.last_async_call.map(|_| job.next_execution);
            jobs.push(self.schedule_job(&job, ran)?.unwrap_or(job));
        }
        Ok(jobs)
    }

    /// Delete a deployment's jobs. Firings already scheduled still run.
    pub fn delete_jobs(&self, key: &DeploymentKey) -> CronResult<usize> {
        let removed = self.store().delete_cron_jobs_for_deployment(key)?;
        info!(deployment = %key, removed, "cron jobs deleted");
        Ok(removed)
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Schedule the next firing of `job` unless one is already pending.
    ///
    /// The next firing follows `ran`, the firing that last ran, or the job's
    /// start time before the first one. A firing that would be in the past
    /// is scheduled now. Scheduling, and failing to, is recorded on the
    /// timeline as CronScheduled.
    pub fn schedule_job(
        &self,
        job: &CronJob,
        ran: Option<DateTime<Utc>>,
    ) -> CronResult<Option<CronJob>> {
        let now = self.clock.now();
        let result = self.try_schedule(job, ran, now);
        match &result {
            Ok(Some(scheduled)) => {
                debug!(
                    job = %job.key,
                    at = %scheduled.next_execution,
                    "cron firing scheduled"
                );
                self.record(job, scheduled.next_execution, None);
            }
            Ok(None) => debug!(job = %job.key, "cron firing already pending"),
            Err(e) => {
                warn!(job = %job.key, error = %e, "failed to schedule cron job");
                self.record(job, job.next_execution, Some(e.to_string()));
            }
        }
        result
    }

    fn try_schedule(
        &self,
        job: &CronJob,
        ran: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CronResult<Option<CronJob>> {
        let origin = AsyncOrigin::Cron(job.key.clone());
        let store = self.store();
        if store
            .async_calls_for_origin(&origin)?
            .iter()
            .any(|call| !call.is_finished())
        {
            return Ok(None);
        }

        let after = ran.or(job.last_execution).unwrap_or(job.start_time);
        let next = next_firing(&job.schedule, after)?.max(now);
        let call = NewAsyncCall {
            scheduled_at: next,
            verb: job.verb.clone(),
            origin,
            request: CRON_REQUEST.to_vec(),
            // A failed firing is not retried; the next one is scheduled.
            remaining_attempts: 0,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            catch_verb: None,
            catching: false,
            parent_request_key: None,
            trace_context: None,
        };
        let (scheduled, _) = store.schedule_cron_job(&job.key, &call, ran, now)?;
        Ok(Some(scheduled))
    }

    fn record(&self, job: &CronJob, scheduled_at: DateTime<Utc>, error: Option<String>) {
        let event = TimelineEvent::new(EventPayload::CronScheduled {
            verb: job.verb.clone(),
            scheduled_at,
            schedule: job.schedule.clone(),
            error,
        })
        .at(self.clock.now())
        .deployment(job.deployment.clone());
        self.timeline.publish(event);
    }

    /// Schedule the next firing after the one that just finished.
    pub fn job_finished(&self, key: &CronJobKey) -> CronResult<Option<CronJob>> {
        let Some(job) = self.store().get_cron_job(key)? else {
            debug!(job = %key, "cron job gone, not rescheduling");
            return Ok(None);
        };
        self.schedule_job(&job, Some(job.next_execution))
    }

    /// Give every job without a pending firing its next one. Returns how
    /// many were scheduled.
    pub fn schedule_all(&self) -> CronResult<usize> {
        let mut scheduled = 0;
        for job in self.store().list_cron_jobs()? {
            let ran = job.last_async_call.map(|_| job.next_execution);
            if self.schedule_job(&job, ran)?.is_some() {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            info!(scheduled, "cron jobs rescheduled");
        }
        Ok(scheduled)
    }

    /// Check every job periodically, on one controller at a time.
    pub fn schedule(&self, scheduler: &Scheduler) -> JobHandle {
        let service = self.clone();
        scheduler.singleton(
            "schedule-cron-jobs",
            Backoff::new(Duration::from_secs(1), RESCAN_INTERVAL),
            move || {
                let service = service.clone();
                async move {
                    service.schedule_all()?;
                    Ok(RESCAN_INTERVAL)
                }
            },
        )
    }

    // ── Deployment lifecycle ───────────────────────────────────────

    /// Follow activations and deactivations until shutdown. Jobs of every
    /// active deployment are created first.
    pub fn spawn_deployment_watcher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self.clone();
        let (view, mut events) = self.state.subscribe_with_view();
        tokio::spawn(async move {
            service.create_active(&view);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ClusterEvent::DeploymentActivated { key, .. }) => {
                            if let Err(e) = service.create_jobs(&key) {
                                warn!(deployment = %key, error = %e, "failed to create cron jobs");
                            }
                        }
                        Some(ClusterEvent::DeploymentDeactivated { key, .. }) => {
                            if let Err(e) = service.delete_jobs(&key) {
                                warn!(deployment = %key, error = %e, "failed to delete cron jobs");
                            }
                        }
                        Some(_) => {}
                        None => {
                            let (view, resubscribed) = service.state.subscribe_with_view();
                            events = resubscribed;
                            service.create_active(&view);
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("cron deployment watcher stopped");
        })
    }

    fn create_active(&self, view: &ClusterView) {
        for deployment in view.active_deployments() {
            if let Err(e) = self.create_jobs(&deployment.key) {
                warn!(deployment = %deployment.key, error = %e, "failed to create cron jobs");
            }
        }
    }
}

impl CronCompletion for CronService {
    fn cron_call_finished(&self, job: &CronJobKey, call: &AsyncCall) -> anyhow::Result<()> {
        debug!(
            %job,
            call = call.id,
            failed = call.state == AsyncCallState::Error,
            "cron firing finished"
        );
        self.job_finished(job)?;
        Ok(())
    }
}

fn next_firing(schedule: &str, after: DateTime<Utc>) -> CronResult<DateTime<Utc>> {
    ftl_schema::cron::next_after(schedule, after).map_err(|source| CronError::Schedule {
        schedule: schedule.to_string(),
        source,
    })
}
