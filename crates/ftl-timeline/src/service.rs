//! An in-memory timeline service.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ftl_core::{DeploymentKey, RequestKey};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::client::TimelineSink;
use crate::error::{TimelineError, TimelineResult};
use crate::event::{EventType, TimelineEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum TimelineFilter {
    Deployments { deployments: Vec<DeploymentKey> },
    Requests { requests: Vec<RequestKey> },
    Types { types: Vec<EventType> },
    Module { module: String, verb: Option<String> },
    Time {
        newer_than: Option<DateTime<Utc>>,
        older_than: Option<DateTime<Utc>>,
    },
    Id { lower: Option<u64>, upper: Option<u64> },
}

impl TimelineFilter {
    fn matches(&self, event: &TimelineEvent) -> bool {
        match self {
            TimelineFilter::Deployments { deployments } => event
                .deployment
                .as_ref()
                .is_some_and(|d| deployments.contains(d)),
            TimelineFilter::Requests { requests } => event
                .request_key
                .as_ref()
                .is_some_and(|r| requests.contains(r)),
            TimelineFilter::Types { types } => types.contains(&event.event_type()),
            TimelineFilter::Module { module, verb } => match verb {
                Some(verb) => event
                    .payload
                    .verb()
                    .is_some_and(|v| v.module == *module && v.name == *verb),
                None => event.modules().any(|m| m == module),
            },
            TimelineFilter::Time {
                newer_than,
                older_than,
            } => {
                let Some(ts) = event.timestamp else {
                    return false;
                };
                newer_than.is_none_or(|n| ts > n) && older_than.is_none_or(|o| ts < o)
            }
            TimelineFilter::Id { lower, upper } => {
                lower.is_none_or(|l| event.id >= l) && upper.is_none_or(|u| event.id <= u)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineQuery {
    #[serde(default)]
    pub filters: Vec<TimelineFilter>,
    pub limit: usize,
    #[serde(default)]
    pub order: Order,
}

impl TimelineQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            filters: Vec::new(),
            limit,
            order: Order::Asc,
        }
    }

    pub fn filter(mut self, filter: TimelineFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }
}

struct Log {
    events: Vec<TimelineEvent>,
    next_id: u64,
}

/// Timeline storage held in memory. Events are appended in id order.
pub struct InMemoryTimeline {
    log: Mutex<Log>,
    updates: broadcast::Sender<TimelineEvent>,
}

impl Default for InMemoryTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTimeline {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self {
            log: Mutex::new(Log {
                events: Vec::new(),
                next_id: 1,
            }),
            updates,
        }
    }

    /// Store a batch. The batch is sorted by timestamp before ids are
    /// assigned; a batch with any untimed event is refused whole.
    pub fn insert(&self, mut events: Vec<TimelineEvent>) -> TimelineResult<Vec<u64>> {
        if events.iter().any(|e| e.timestamp.is_none()) {
            return Err(TimelineError::InvalidArgument("timestamp is required".into()));
        }
        events.sort_by_key(|e| e.timestamp);
        let mut log = self.log.lock().expect("timeline lock");
        let mut ids = Vec::with_capacity(events.len());
        for mut event in events {
            event.id = log.next_id;
            log.next_id += 1;
            ids.push(event.id);
            let _ = self.updates.send(event.clone());
            log.events.push(event);
        }
        debug!(count = ids.len(), "timeline events inserted");
        Ok(ids)
    }

    pub fn get_timeline(&self, query: &TimelineQuery) -> TimelineResult<Vec<TimelineEvent>> {
        if query.limit == 0 {
            return Err(TimelineError::InvalidArgument("limit must be > 0".into()));
        }
        let log = self.log.lock().expect("timeline lock");
        let matching = |e: &&TimelineEvent| query.filters.iter().all(|f| f.matches(e));
        let events = match query.order {
            Order::Asc => log
                .events
                .iter()
                .filter(matching)
                .take(query.limit)
                .cloned()
                .collect(),
            Order::Desc => log
                .events
                .iter()
                .rev()
                .filter(matching)
                .take(query.limit)
                .cloned()
                .collect(),
        };
        Ok(events)
    }

    /// Remove events of `event_type` older than `age`. Returns how many went.
    pub fn delete_old_events(&self, event_type: EventType, age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let mut log = self.log.lock().expect("timeline lock");
        let before = log.events.len();
        log.events.retain(|e| {
            e.event_type() != event_type || e.timestamp.is_some_and(|ts| ts >= cutoff)
        });
        let deleted = before - log.events.len();
        debug!(%event_type, deleted, "old timeline events deleted");
        deleted
    }

    /// Events inserted from now on.
    pub fn stream(&self) -> broadcast::Receiver<TimelineEvent> {
        self.updates.subscribe()
    }
}

#[async_trait]
impl TimelineSink for InMemoryTimeline {
    async fn create_events(&self, events: Vec<TimelineEvent>) -> TimelineResult<()> {
        self.insert(events).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ftl_core::{Origin, RefKey};

    use super::*;
    use crate::event::{EventPayload, LogLevel};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn log(at: i64, message: &str) -> TimelineEvent {
        TimelineEvent::new(EventPayload::Log {
            level: LogLevel::Info,
            message: message.into(),
            attributes: Default::default(),
            error: None,
        })
        .at(t(at))
    }

    fn call(at: i64, module: &str, verb: &str) -> TimelineEvent {
        TimelineEvent::new(EventPayload::Call {
            source: None,
            destination: RefKey::new(module, verb),
            parent_request_key: None,
            request: "{}".into(),
            response: Some("{}".into()),
            error: None,
            duration_ms: 3,
        })
        .at(t(at))
    }

    #[test]
    fn batches_are_sorted_before_ids_are_assigned() {
        let timeline = InMemoryTimeline::new();
        let ids = timeline
            .insert(vec![log(3, "c"), log(1, "a"), log(2, "b")])
            .unwrap();
        assert_eq!(ids, [1, 2, 3]);
        let events = timeline.get_timeline(&TimelineQuery::new(10)).unwrap();
        let messages: Vec<_> = events
            .iter()
            .map(|e| match &e.payload {
                EventPayload::Log { message, .. } => message.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(messages, ["a", "b", "c"]);
    }

    #[test]
    fn untimed_events_and_zero_limits_are_refused() {
        let timeline = InMemoryTimeline::new();
        let mut untimed = log(0, "x");
        untimed.timestamp = None;
        assert_eq!(
            timeline.insert(vec![log(0, "ok"), untimed]).unwrap_err(),
            TimelineError::InvalidArgument("timestamp is required".into())
        );
        assert!(timeline.get_timeline(&TimelineQuery::new(1)).unwrap().is_empty());
        assert_eq!(
            timeline.get_timeline(&TimelineQuery::new(0)).unwrap_err().to_string(),
            "limit must be > 0"
        );
    }

    #[test]
    fn filters_combine() {
        let timeline = InMemoryTimeline::new();
        let request = RequestKey::new(Origin::Ingress, "GET /echo");
        let deployment = DeploymentKey::new("echo");
        timeline
            .insert(vec![
                call(1, "echo", "echo")
                    .request(Some(request.clone()))
                    .deployment(deployment.clone()),
                call(2, "time", "time").request(Some(request.clone())),
                log(3, "hello").deployment(deployment.clone()),
                call(4, "echo", "other"),
            ])
            .unwrap();

        let by_request = TimelineQuery::new(10).filter(TimelineFilter::Requests {
            requests: vec![request.clone()],
        });
        assert_eq!(timeline.get_timeline(&by_request).unwrap().len(), 2);

        let calls_to_echo = TimelineQuery::new(10)
            .filter(TimelineFilter::Types {
                types: vec![EventType::Call],
            })
            .filter(TimelineFilter::Module {
                module: "echo".into(),
                verb: None,
            });
        assert_eq!(timeline.get_timeline(&calls_to_echo).unwrap().len(), 2);

        let one_verb = TimelineQuery::new(10).filter(TimelineFilter::Module {
            module: "echo".into(),
            verb: Some("echo".into()),
        });
        assert_eq!(timeline.get_timeline(&one_verb).unwrap().len(), 1);

        let by_deployment = TimelineQuery::new(10).filter(TimelineFilter::Deployments {
            deployments: vec![deployment],
        });
        assert_eq!(timeline.get_timeline(&by_deployment).unwrap().len(), 2);

        let window = TimelineQuery::new(10).filter(TimelineFilter::Time {
            newer_than: Some(t(1)),
            older_than: Some(t(4)),
        });
        assert_eq!(timeline.get_timeline(&window).unwrap().len(), 2);
    }

    #[test]
    fn limit_and_order() {
        let timeline = InMemoryTimeline::new();
        timeline
            .insert((0..5).map(|i| log(i, "x")).collect())
            .unwrap();
        let newest = timeline
            .get_timeline(&TimelineQuery::new(2).order(Order::Desc))
            .unwrap();
        assert_eq!(newest.iter().map(|e| e.id).collect::<Vec<_>>(), [5, 4]);
        let oldest = timeline.get_timeline(&TimelineQuery::new(2)).unwrap();
        assert_eq!(oldest.iter().map(|e| e.id).collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn old_events_of_one_type_are_deleted() {
        let timeline = InMemoryTimeline::new();
        timeline
            .insert(vec![log(0, "old"), call(0, "echo", "echo"), log(100, "new")])
            .unwrap();
        let deleted = timeline.delete_old_events(EventType::Log, Duration::from_secs(50), t(100));
        assert_eq!(deleted, 1);
        assert_eq!(timeline.get_timeline(&TimelineQuery::new(10)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn inserted_events_are_streamed() {
        let timeline = InMemoryTimeline::new();
        let mut stream = timeline.stream();
        timeline.create_events(vec![log(1, "live")]).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().id, 1);
    }
}
