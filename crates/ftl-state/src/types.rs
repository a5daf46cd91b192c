//! Row types persisted in the state store.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_core::{
    CronJobKey, DeploymentKey, RefKey, RequestKey, SubscriberKey, SubscriptionKey, TopicEventKey,
    TopicKey,
};
use ftl_schema::{FromOffset, RetryParams};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Async calls ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncCallState {
    Pending,
    Executing,
    Success,
    Error,
}

/// What created an async call. Renders as `cron:<job key>` or
/// `sub:<module>.<subscription>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AsyncOrigin {
    Cron(CronJobKey),
    PubSub(RefKey),
}

impl fmt::Display for AsyncOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncOrigin::Cron(key) => write!(f, "cron:{key}"),
            AsyncOrigin::PubSub(subscription) => write!(f, "sub:{subscription}"),
        }
    }
}

impl FromStr for AsyncOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("cron", key)) => CronJobKey::parse(key)
                .map(AsyncOrigin::Cron)
                .map_err(|e| format!("invalid cron origin {s:?}: {e}")),
            Some(("sub", subscription)) => subscription
                .parse()
                .map(AsyncOrigin::PubSub)
                .map_err(|e| format!("invalid subscription origin {s:?}: {e}")),
            _ => Err(format!("unknown async call origin {s:?}")),
        }
    }
}

impl Serialize for AsyncOrigin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AsyncOrigin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// An async call to be created. The store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAsyncCall {
    pub scheduled_at: DateTime<Utc>,
    pub verb: RefKey,
    pub origin: AsyncOrigin,
    pub request: Vec<u8>,
    pub remaining_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub catch_verb: Option<RefKey>,
    /// True for an attempt that invokes the catch verb.
    pub catching: bool,
    pub parent_request_key: Option<RequestKey>,
    pub trace_context: Option<String>,
}

/// One attempt of an async call. Retries are new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncCall {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub verb: RefKey,
    pub origin: AsyncOrigin,
    pub request: Vec<u8>,
    pub remaining_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub catch_verb: Option<RefKey>,
    #[serde(default)]
    pub catching: bool,
    pub parent_request_key: Option<RequestKey>,
    pub trace_context: Option<String>,
    pub state: AsyncCallState,
    /// Lease expiry while executing.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub response: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl AsyncCall {
    pub(crate) fn from_new(id: u64, now: DateTime<Utc>, call: &NewAsyncCall) -> Self {
        Self {
            id,
            created_at: now,
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
            state: AsyncCallState::Pending,
            lease_expires_at: None,
            response: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, AsyncCallState::Success | AsyncCallState::Error)
    }
}

// ── Pub/sub ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicRow {
    pub key: TopicKey,
    pub module: String,
    pub name: String,
    /// The event type, printed.
    pub event_type: String,
    /// Sequence number of the newest event; 0 when empty.
    pub head: u64,
    pub head_key: Option<TopicEventKey>,
}

impl TopicRow {
    pub fn reference(&self) -> RefKey {
        RefKey::new(&self.module, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub key: TopicEventKey,
    pub seq: u64,
    pub module: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub caller: Option<RefKey>,
    pub created_at: DateTime<Utc>,
    pub request_key: Option<RequestKey>,
    pub trace_context: Option<String>,
}

/// An event to append to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTopicEvent {
    pub topic: RefKey,
    pub payload: Vec<u8>,
    pub caller: Option<RefKey>,
    pub request_key: Option<RequestKey>,
    pub trace_context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Idle,
    Executing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub key: SubscriptionKey,
    pub module: String,
    pub name: String,
    pub topic: RefKey,
    pub deployment: DeploymentKey,
    /// Sequence number of the last consumed event; 0 before the first.
    pub cursor: u64,
    pub cursor_key: Option<TopicEventKey>,
    pub state: SubscriptionState,
    pub from: FromOffset,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    pub fn reference(&self) -> RefKey {
        RefKey::new(&self.module, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRow {
    pub key: SubscriberKey,
    pub subscription: RefKey,
    pub deployment: DeploymentKey,
    pub sink: RefKey,
    pub retry: RetryParams,
}

/// What one progression step did for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Another progression holds the subscription.
    Locked,
    /// The cursor is at the topic head.
    CaughtUp,
    /// The next event is younger than the consumption delay.
    NotReady,
    /// No subscriber is registered; the cursor did not move.
    NoSubscriber { event: TopicEvent },
    Dispatched {
        event: TopicEvent,
        subscriber: SubscriberRow,
        call_id: u64,
    },
}

// ── Cron ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub key: CronJobKey,
    pub deployment: DeploymentKey,
    pub verb: RefKey,
    pub schedule: String,
    pub start_time: DateTime<Utc>,
    pub next_execution: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_async_call: Option<u64>,
}

// ── Leases ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

// ── Config and secrets ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Config,
    Secret,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Config => "config",
            ValueKind::Secret => "secret",
        }
    }
}

/// A stored config or secret value. `module` is `None` for global values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub module: Option<String>,
    pub name: String,
    pub value: Vec<u8>,
}

impl StoredValue {
    /// `name` for global values, `module.name` otherwise.
    pub fn reference(&self) -> String {
        match &self.module {
            Some(module) => format!("{module}.{}", self.name),
            None => self.name.clone(),
        }
    }
}
