//! Scheduled task runner.
//!
//! A job is an async function returning how long to wait before its next
//! run. Errors are logged and retried with the job's [`Backoff`]; a success
//! resets the backoff and waits for the returned delay, or for the minimum
//! backoff when the job returned zero. Jobs can be nudged to run early.
//!
//! Parallel jobs run on every controller. Singleton jobs take a lease named
//! after the job before each run and skip the run while another controller
//! holds it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::SchedulerError;
use crate::lease::{DEFAULT_LEASE_TTL, Lease, Leaser};

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<Duration>> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Clamp every job's backoff to one second.
    pub dev_mode: bool,
    pub lease_ttl: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            dev_mode: false,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// Wakes a job before its delay runs out.
#[derive(Clone)]
pub struct JobHandle {
    name: Arc<str>,
    nudge: Arc<Notify>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the job as soon as it is idle. Nudges while it runs coalesce.
    pub fn trigger(&self) {
        self.nudge.notify_one();
    }
}

pub struct Scheduler {
    leaser: Arc<dyn Leaser>,
    options: SchedulerOptions,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum Kind {
    Parallel,
    Singleton,
}

impl Scheduler {
    pub fn new(
        leaser: Arc<dyn Leaser>,
        options: SchedulerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            leaser,
            options,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `job` on this controller regardless of others.
    pub fn parallel<F, Fut>(&self, name: &str, retry: Backoff, job: F) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Duration>> + Send + 'static,
    {
        self.spawn(Kind::Parallel, name, retry, job)
    }

    /// Run `job` only while this controller holds the job's lease.
    pub fn singleton<F, Fut>(&self, name: &str, retry: Backoff, job: F) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Duration>> + Send + 'static,
    {
        self.spawn(Kind::Singleton, name, retry, job)
    }

    /// Wait for every job to stop. Jobs stop when the shutdown signal flips.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("scheduler lock"));
        for task in tasks {
            let _ = task.await;
        }
    }

    fn spawn<F, Fut>(&self, kind: Kind, name: &str, retry: Backoff, job: F) -> JobHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Duration>> + Send + 'static,
    {
        let job: JobFn = Arc::new(move || Box::pin(job()) as JobFuture);
        let retry = if self.options.dev_mode {
            retry.clamped_for_dev()
        } else {
            retry
        };
        let handle = JobHandle {
            name: Arc::from(name),
            nudge: Arc::new(Notify::new()),
        };
        let lease = match kind {
            Kind::Parallel => None,
            Kind::Singleton => Some((Arc::clone(&self.leaser), self.options.lease_ttl)),
        };
        let task = tokio::spawn(run_job(
            handle.clone(),
            job,
            retry,
            lease,
            self.shutdown.clone(),
        ));
        self.tasks.lock().expect("scheduler lock").push(task);
        debug!(job = name, "job scheduled");
        handle
    }
}

async fn run_job(
    handle: JobHandle,
    job: JobFn,
    mut retry: Backoff,
    lease: Option<(Arc<dyn Leaser>, Duration)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = handle.name();
    let mut delay = Duration::ZERO;
    let mut held: Option<Lease> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = handle.nudge.notified() => {}
            _ = shutdown.changed() => break,
        }

        if let Some((leaser, ttl)) = &lease {
            match leaser.acquire(name, *ttl).await {
                Ok(acquired) => held = Some(acquired),
                Err(SchedulerError::LeaseHeld(_)) => {
                    debug!(job = name, "lease held elsewhere, skipping run");
                    held = None;
                    delay = retry.next_delay();
                    continue;
                }
                Err(e) => {
                    warn!(job = name, error = %e, "failed to acquire job lease");
                    delay = retry.next_delay();
                    continue;
                }
            }
        }

        match job().await {
            Ok(next) => {
                retry.reset();
                delay = if next.is_zero() { retry.next_delay() } else { next };
            }
            Err(e) => {
                delay = retry.next_delay();
                warn!(job = name, error = %e, attempt = retry.attempt(), retry_in = ?delay, "job failed");
            }
        }
    }

    if let (Some((leaser, _)), Some(lease)) = (&lease, &held) {
        if let Err(e) = leaser.release(lease).await {
            warn!(job = name, error = %e, "failed to release job lease");
        }
    }
    info!(job = name, "job stopped");
}
