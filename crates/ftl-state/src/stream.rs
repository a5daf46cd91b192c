//! A single-writer event stream that reduces events into a view.
//!
//! `publish` applies an event to a copy of the current view under the writer
//! lock, swaps the copy in and fans the event out to subscribers. Readers take
//! an `Arc` snapshot and never block the writer for longer than a clone.
//!
//! Each subscriber owns a bounded channel. A subscriber whose channel is full
//! is dropped with a warning so one slow consumer can never stall the writer
//! or the other subscribers; it observes the drop as the end of its stream.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

/// Buffered events per subscriber before it is considered too slow.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// An event that knows how to change a view of type `V`.
pub trait StreamEvent<V>: Clone + Send + Sync + 'static {
    type Error;

    /// Apply the event. On error the caller discards `view`.
    fn apply(&self, view: &mut V) -> Result<(), Self::Error>;
}

struct Subscriber<E> {
    id: u64,
    tx: mpsc::Sender<E>,
}

struct Inner<V, E> {
    view: Arc<V>,
    subscribers: Vec<Subscriber<E>>,
    next_id: u64,
}

impl<V, E: Clone> Inner<V, E> {
    fn broadcast(&mut self, event: &E) {
        self.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "event stream subscriber is too slow, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

pub struct EventStream<V, E> {
    inner: Arc<Mutex<Inner<V, E>>>,
    buffer: usize,
}

impl<V, E> Clone for EventStream<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            buffer: self.buffer,
        }
    }
}

/// The receiving end of [`EventStream::subscribe`].
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once unsubscribed or dropped as slow.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<V, E> EventStream<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: StreamEvent<V>,
{
    pub fn new(initial: V) -> Self {
        Self::with_buffer(initial, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(initial: V, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                view: Arc::new(initial),
                subscribers: Vec::new(),
                next_id: 0,
            })),
            buffer: buffer.max(1),
        }
    }

    /// Build a stream whose view is `initial` with `events` applied in order.
    pub fn replay(initial: V, events: impl IntoIterator<Item = E>) -> Result<Self, E::Error> {
        let mut view = initial;
        for event in events {
            event.apply(&mut view)?;
        }
        Ok(Self::new(view))
    }

    /// Apply `event` and broadcast it. Returns the view after the event.
    pub fn publish(&self, event: E) -> Result<Arc<V>, E::Error> {
        self.publish_then(event, |_| Ok(()))
    }

    /// Like [`publish`](Self::publish), but runs `commit` under the writer
    /// lock once the event applied cleanly. If `commit` fails the view is
    /// left unchanged and nothing is broadcast.
    pub fn publish_then<X, F>(&self, event: E, commit: F) -> Result<Arc<V>, X>
    where
        X: From<E::Error>,
        F: FnOnce(&E) -> Result<(), X>,
    {
        let mut inner = self.inner.lock().expect("event stream lock");
        let mut next = V::clone(&inner.view);
        event.apply(&mut next)?;
        commit(&event)?;
        let next = Arc::new(next);
        inner.view = Arc::clone(&next);
        inner.broadcast(&event);
        Ok(next)
    }

    /// Choose events from the current view and publish them together under
    /// the writer lock, so nothing `decide` checked can change before they
    /// apply. `commit` sees all of them once they applied cleanly. Any
    /// failure leaves the view unchanged and broadcasts nothing.
    pub fn publish_with<T, X, D, F>(&self, decide: D, commit: F) -> Result<(Arc<V>, T), X>
    where
        X: From<E::Error>,
        D: FnOnce(&V) -> Result<(Vec<E>, T), X>,
        F: FnOnce(&[E]) -> Result<(), X>,
    {
        let mut inner = self.inner.lock().expect("event stream lock");
        let (events, value) = decide(&inner.view)?;
        if events.is_empty() {
            return Ok((Arc::clone(&inner.view), value));
        }
        let mut next = V::clone(&inner.view);
        for event in &events {
            event.apply(&mut next)?;
        }
        commit(&events)?;
        let next = Arc::new(next);
        inner.view = Arc::clone(&next);
        for event in &events {
            inner.broadcast(event);
        }
        Ok((next, value))
    }

    /// A snapshot of the current view.
    pub fn view(&self) -> Arc<V> {
        Arc::clone(&self.inner.lock().expect("event stream lock").view)
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.inner.lock().expect("event stream lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Subscribe and take a snapshot atomically, so no event falls between
    /// the snapshot and the first received event.
    pub fn subscribe_with_view(&self) -> (Arc<V>, Subscription<E>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.inner.lock().expect("event stream lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        (Arc::clone(&inner.view), Subscription { id, rx })
    }

    pub fn unsubscribe(&self, subscription: Subscription<E>) {
        let mut inner = self.inner.lock().expect("event stream lock");
        inner.subscribers.retain(|sub| sub.id != subscription.id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event stream lock").subscribers.len()
    }
}
