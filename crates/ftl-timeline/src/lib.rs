//! ftl-timeline: the observability record of a running cluster.
//!
//! Components publish [`TimelineEvent`]s through a [`TimelineClient`], which
//! batches them to a [`TimelineSink`]. Publishing is best effort and never
//! fails the operation being recorded. [`InMemoryTimeline`] is the sink the
//! daemon serves queries from.

pub mod client;
pub mod error;
pub mod event;
pub mod service;

pub use client::{ClientOptions, ClientStats, TimelineClient, TimelineSink};
pub use error::{TimelineError, TimelineResult};
pub use event::{AsyncEventType, EventPayload, EventType, LogLevel, TimelineEvent};
pub use service::{InMemoryTimeline, Order, TimelineFilter, TimelineQuery};
