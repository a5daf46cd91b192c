//! Batched, best-effort publishing to the timeline.
//!
//! [`TimelineClient::publish`] never blocks: it enqueues the event or drops
//! it when the queue is full. A background task flushes the queue to a
//! [`TimelineSink`] in batches of up to `batch_size` events, or after
//! `flush_interval` once a batch has started, whichever comes first. A batch
//! the sink rejects is lost. Queue-full and sink-failure warnings are
//! coalesced to one per `warn_interval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::TimelineResult;
use crate::event::TimelineEvent;

/// Where batches go.
#[async_trait]
pub trait TimelineSink: Send + Sync + 'static {
    async fn create_events(&self, events: Vec<TimelineEvent>) -> TimelineResult<()>;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub warn_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            batch_size: 16,
            flush_interval: Duration::from_millis(100),
            warn_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    pub inserted: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Lets a warning through at most once per interval.
#[derive(Debug)]
struct Coalesce {
    every: Duration,
    last: Mutex<Option<Instant>>,
}

impl Coalesce {
    fn new(every: Duration) -> Self {
        Self {
            every,
            last: Mutex::new(None),
        }
    }

    fn ready(&self) -> bool {
        let mut last = self.last.lock().expect("coalesce lock");
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.every => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[derive(Clone)]
pub struct TimelineClient {
    tx: mpsc::Sender<TimelineEvent>,
    counters: Arc<Counters>,
    queue_full: Arc<Coalesce>,
}

impl TimelineClient {
    /// Start a client with default options. The flush task stops when
    /// `shutdown` flips, after flushing what is queued.
    pub fn spawn(
        sink: Arc<dyn TimelineSink>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn_with(sink, ClientOptions::default(), shutdown)
    }

    pub fn spawn_with(
        sink: Arc<dyn TimelineSink>,
        options: ClientOptions,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let client = Self {
            tx,
            counters: Arc::clone(&counters),
            queue_full: Arc::new(Coalesce::new(options.warn_interval)),
        };
        let handle = tokio::spawn(run_flusher(rx, sink, options, counters, shutdown));
        (client, handle)
    }

    /// Enqueue an event, or drop it if the queue is full.
    pub fn publish(&self, event: TimelineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            if self.queue_full.ready() {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "client stopped",
                };
                warn!(
                    reason,
                    dropped = self.counters.dropped.load(Ordering::Relaxed),
                    "dropping timeline events"
                );
            }
        }
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            inserted: self.counters.inserted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_flusher(
    mut rx: mpsc::Receiver<TimelineEvent>,
    sink: Arc<dyn TimelineSink>,
    options: ClientOptions,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let batch_size = options.batch_size.max(1);
    let failures = Coalesce::new(options.warn_interval);
    let mut batch = Vec::with_capacity(batch_size);
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    if batch.is_empty() {
                        deadline = Instant::now() + options.flush_interval;
                    }
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(&*sink, &mut batch, &counters, &failures).await;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => {
                flush(&*sink, &mut batch, &counters, &failures).await;
            }
            _ = shutdown.changed() => {
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(&*sink, &mut batch, &counters, &failures).await;
                    }
                }
                break;
            }
        }
    }
    flush(&*sink, &mut batch, &counters, &failures).await;
    debug!("timeline client stopped");
}

async fn flush(
    sink: &dyn TimelineSink,
    batch: &mut Vec<TimelineEvent>,
    counters: &Counters,
    failures: &Coalesce,
) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len() as u64;
    match sink.create_events(events).await {
        Ok(()) => {
            counters.inserted.fetch_add(count, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(count, Ordering::Relaxed);
            if failures.ready() {
                warn!(error = %e, lost = count, "failed to insert timeline events");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ftl_core::RefKey;

    use super::*;
    use crate::error::TimelineError;
    use crate::event::{AsyncEventType, EventPayload};

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<TimelineEvent>>>,
        fail: bool,
    }

    #[async_trait]
    impl TimelineSink for Recorder {
        async fn create_events(&self, events: Vec<TimelineEvent>) -> TimelineResult<()> {
            if self.fail {
                return Err(TimelineError::Unavailable("down".into()));
            }
            self.batches.lock().unwrap().push(events);
            Ok(())
        }
    }

    fn event(n: u64) -> TimelineEvent {
        let mut event = TimelineEvent::new(EventPayload::AsyncExecute {
            verb: RefKey::new("echo", "tick"),
            async_event_type: AsyncEventType::Cron,
            error: None,
        });
        event.id = n;
        event
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_full_batches_and_stragglers() {
        let sink = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);
        let (client, _handle) = TimelineClient::spawn(sink.clone(), rx);
        for n in 0..20 {
            client.publish(event(n));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), [16, 4]);
        let ids: Vec<u64> = batches.iter().flatten().map(|e| e.id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
        assert_eq!(client.stats().inserted, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_the_interval() {
        let sink = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);
        let (client, _handle) = TimelineClient::spawn(sink.clone(), rx);
        client.publish(event(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.batches.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_events() {
        let sink = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);
        let options = ClientOptions {
            queue_size: 2,
            ..ClientOptions::default()
        };
        let (client, _handle) = TimelineClient::spawn_with(sink.clone(), options, rx);
        for n in 0..5 {
            client.publish(event(n));
        }
        assert_eq!(client.stats().dropped, 3);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.stats().inserted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failures_lose_the_batch() {
        let sink = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let (_tx, rx) = watch::channel(false);
        let (client, _handle) = TimelineClient::spawn(sink, rx);
        for n in 0..3 {
            client.publish(event(n));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            client.stats(),
            ClientStats {
                inserted: 0,
                dropped: 0,
                failed: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_the_queue() {
        let sink = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);
        let (client, handle) = TimelineClient::spawn(sink.clone(), rx);
        for n in 0..3 {
            client.publish(event(n));
        }
        tx.send(true).unwrap();
        handle.await.unwrap();
        let total: usize = sink.batches.lock().unwrap().iter().map(Vec::len).sum();
        assert_eq!(total, 3);
    }
}
