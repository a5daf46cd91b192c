//! Timeline events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ftl_core::{DeploymentKey, RefKey, RequestKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Log,
    Call,
    Ingress,
    DeploymentCreated,
    DeploymentUpdated,
    CronScheduled,
    AsyncExecute,
    PubsubPublish,
    PubsubConsume,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::Log,
        EventType::Call,
        EventType::Ingress,
        EventType::DeploymentCreated,
        EventType::DeploymentUpdated,
        EventType::CronScheduled,
        EventType::AsyncExecute,
        EventType::PubsubPublish,
        EventType::PubsubConsume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Log => "log",
            EventType::Call => "call",
            EventType::Ingress => "ingress",
            EventType::DeploymentCreated => "deployment_created",
            EventType::DeploymentUpdated => "deployment_updated",
            EventType::CronScheduled => "cron_scheduled",
            EventType::AsyncExecute => "async_execute",
            EventType::PubsubPublish => "pubsub_publish",
            EventType::PubsubConsume => "pubsub_consume",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Why an async call was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncEventType {
    Cron,
    Pubsub,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: BTreeMap<String, String>,
        error: Option<String>,
    },
    Call {
        source: Option<RefKey>,
        destination: RefKey,
        parent_request_key: Option<RequestKey>,
        request: String,
        response: Option<String>,
        error: Option<String>,
        duration_ms: u64,
    },
    Ingress {
        verb: RefKey,
        method: String,
        path: String,
        status: u16,
        request: String,
        response: Option<String>,
        error: Option<String>,
        duration_ms: u64,
    },
    DeploymentCreated {
        module: String,
        language: String,
        min_replicas: u32,
        replaced: Option<DeploymentKey>,
    },
    DeploymentUpdated {
        module: String,
        min_replicas: u32,
        prev_min_replicas: u32,
    },
    CronScheduled {
        verb: RefKey,
        scheduled_at: DateTime<Utc>,
        schedule: String,
        error: Option<String>,
    },
    AsyncExecute {
        verb: RefKey,
        async_event_type: AsyncEventType,
        error: Option<String>,
    },
    PubsubPublish {
        verb: Option<RefKey>,
        topic: RefKey,
        request: String,
        error: Option<String>,
    },
    PubsubConsume {
        verb: Option<RefKey>,
        topic: RefKey,
        subscription: RefKey,
        error: Option<String>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Log { .. } => EventType::Log,
            EventPayload::Call { .. } => EventType::Call,
            EventPayload::Ingress { .. } => EventType::Ingress,
            EventPayload::DeploymentCreated { .. } => EventType::DeploymentCreated,
            EventPayload::DeploymentUpdated { .. } => EventType::DeploymentUpdated,
            EventPayload::CronScheduled { .. } => EventType::CronScheduled,
            EventPayload::AsyncExecute { .. } => EventType::AsyncExecute,
            EventPayload::PubsubPublish { .. } => EventType::PubsubPublish,
            EventPayload::PubsubConsume { .. } => EventType::PubsubConsume,
        }
    }

    /// The verb this event is about, if any.
    pub fn verb(&self) -> Option<&RefKey> {
        match self {
            EventPayload::Call { destination, .. } => Some(destination),
            EventPayload::Ingress { verb, .. }
            | EventPayload::CronScheduled { verb, .. }
            | EventPayload::AsyncExecute { verb, .. } => Some(verb),
            EventPayload::PubsubPublish { verb, .. } | EventPayload::PubsubConsume { verb, .. } => {
                verb.as_ref()
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            EventPayload::Log { error, .. }
            | EventPayload::Call { error, .. }
            | EventPayload::Ingress { error, .. }
            | EventPayload::CronScheduled { error, .. }
            | EventPayload::AsyncExecute { error, .. }
            | EventPayload::PubsubPublish { error, .. }
            | EventPayload::PubsubConsume { error, .. } => error.as_deref(),
            EventPayload::DeploymentCreated { .. } | EventPayload::DeploymentUpdated { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Assigned by the timeline service.
    #[serde(default)]
    pub id: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub deployment: Option<DeploymentKey>,
    pub request_key: Option<RequestKey>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl TimelineEvent {
    /// An event stamped with the current time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: 0,
            timestamp: Some(Utc::now()),
            deployment: None,
            request_key: None,
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn deployment(mut self, deployment: DeploymentKey) -> Self {
        self.deployment = Some(deployment);
        self
    }

    pub fn request(mut self, request_key: Option<RequestKey>) -> Self {
        self.request_key = request_key;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Modules this event concerns: its verb's module and its deployment's.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        let verb = self.payload.verb().map(|v| v.module.as_str());
        let source = match &self.payload {
            EventPayload::Call {
                source: Some(source),
                ..
            } => Some(source.module.as_str()),
            EventPayload::PubsubPublish { topic, .. } | EventPayload::PubsubConsume { topic, .. } => {
                Some(topic.module.as_str())
            }
            EventPayload::DeploymentCreated { module, .. }
            | EventPayload::DeploymentUpdated { module, .. } => Some(module.as_str()),
            _ => None,
        };
        let deployment = self.deployment.as_ref().map(|d| d.module());
        verb.into_iter().chain(source).chain(deployment)
    }
}
