//! ftl-pubsub: topics, subscriptions and async call execution.
//!
//! Runners publish to topics through [`PubSubService::publish_event`]. The
//! progression job hands each subscription's next ready event to one of its
//! subscribers by creating an async call, and [`AsyncExecutor`] runs those
//! calls through the dispatcher with retries and catch verbs. A subscription
//! only moves on once its current delivery is finished, so each
//! subscription sees its topic in order.

pub mod error;
pub mod executor;
pub mod service;

pub use error::{PubSubError, PubSubResult};
pub use executor::{AsyncExecutor, CronCompletion, DEFAULT_CALL_LEASE, LEASE_EXPIRED};
pub use service::{PROGRESS_INTERVAL, PubSubService, PublishEvent};
