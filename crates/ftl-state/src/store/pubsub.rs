use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_core::{DeploymentKey, RefKey, SubscriberKey, SubscriptionKey, TopicEventKey, TopicKey};
use ftl_schema::{FromOffset, RetryParams};
use redb::ReadableTable;
use tracing::debug;

use super::async_calls::insert_async_call;
use super::{StateStore, get_row, put_row, scan_rows};
use crate::error::{StateError, StateResult};
use crate::tables::{SUBSCRIBERS, SUBSCRIPTIONS, TOPIC_EVENTS, TOPICS};
use crate::types::*;

fn ref_key(r: &RefKey) -> String {
    r.to_string()
}

fn event_key(topic: &RefKey, seq: u64) -> String {
    format!("{topic}/{seq:020}")
}

fn subscriber_prefix(subscription: &RefKey) -> String {
    format!("{subscription}/")
}

impl StateStore {
    // ── Topics ─────────────────────────────────────────────────────

    /// Create a topic, or update its event type while keeping its log.
    pub fn upsert_topic(&self, module: &str, name: &str, event_type: &str) -> StateResult<TopicRow> {
        let reference = RefKey::new(module, name);
        self.write(|txn| {
            let mut table = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            let row = match get_row::<TopicRow, _>(&table, &ref_key(&reference))? {
                Some(existing) => TopicRow {
                    event_type: event_type.to_string(),
                    ..existing
                },
                None => TopicRow {
                    key: TopicKey::new(module, name),
                    module: module.to_string(),
                    name: name.to_string(),
                    event_type: event_type.to_string(),
                    head: 0,
                    head_key: None,
                },
            };
            put_row(&mut table, &ref_key(&reference), &row)?;
            Ok(row)
        })
    }

    pub fn get_topic(&self, topic: &RefKey) -> StateResult<Option<TopicRow>> {
        self.read(|txn| {
            let table = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            get_row(&table, &ref_key(topic))
        })
    }

    pub fn list_topics(&self) -> StateResult<Vec<TopicRow>> {
        self.read(|txn| {
            let table = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            scan_rows(&table, "")
        })
    }

    /// Append an event to a topic's log and move its head.
    pub fn publish_topic_event(&self, event: &NewTopicEvent, now: DateTime<Utc>) -> StateResult<TopicEvent> {
        let stored = self.write(|txn| {
            let mut topics = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            let mut topic: TopicRow = get_row(&topics, &ref_key(&event.topic))?
                .ok_or_else(|| StateError::NotFound(format!("topic {} not found", event.topic)))?;
            let seq = topic.head + 1;
            let stored = TopicEvent {
                key: TopicEventKey::new(&topic.module, &topic.name),
                seq,
                module: topic.module.clone(),
                topic: topic.name.clone(),
                payload: event.payload.clone(),
                caller: event.caller.clone(),
                created_at: now,
                request_key: event.request_key.clone(),
                trace_context: event.trace_context.clone(),
            };
            let mut events = txn.open_table(TOPIC_EVENTS).map_err(map_err!(Table))?;
            put_row(&mut events, &event_key(&event.topic, seq), &stored)?;
            topic.head = seq;
            topic.head_key = Some(stored.key.clone());
            put_row(&mut topics, &ref_key(&event.topic), &topic)?;
            Ok(stored)
        })?;
        debug!(topic = %event.topic, seq = stored.seq, "topic event published");
        Ok(stored)
    }

    /// A topic's events in publish order.
    pub fn topic_events(&self, topic: &RefKey) -> StateResult<Vec<TopicEvent>> {
        self.read(|txn| {
            let table = txn.open_table(TOPIC_EVENTS).map_err(map_err!(Table))?;
            scan_rows(&table, &format!("{topic}/"))
        })
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Create a subscription, or hand an existing one to a new deployment
    /// while keeping its cursor. New subscriptions start at the beginning
    /// of the topic, or at its head with [`FromOffset::Latest`].
    pub fn upsert_subscription(
        &self,
        module: &str,
        name: &str,
        topic: &RefKey,
        deployment: &DeploymentKey,
        from: FromOffset,
        now: DateTime<Utc>,
    ) -> StateResult<SubscriptionRow> {
        let reference = RefKey::new(module, name);
        self.write(|txn| {
            let topics = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            let head = get_row::<TopicRow, _>(&topics, &ref_key(topic))?;
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let row = match get_row::<SubscriptionRow, _>(&table, &ref_key(&reference))? {
                Some(existing) => SubscriptionRow {
                    deployment: deployment.clone(),
                    topic: topic.clone(),
                    ..existing
                },
                None => {
                    let (cursor, cursor_key) = match (from, head) {
                        (FromOffset::Latest, Some(head)) => (head.head, head.head_key),
                        _ => (0, None),
                    };
                    SubscriptionRow {
                        key: SubscriptionKey::new(module, name),
                        module: module.to_string(),
                        name: name.to_string(),
                        topic: topic.clone(),
                        deployment: deployment.clone(),
                        cursor,
                        cursor_key,
                        state: SubscriptionState::Idle,
                        from,
                        created_at: now,
                    }
                }
            };
            put_row(&mut table, &ref_key(&reference), &row)?;
            Ok(row)
        })
    }

    pub fn get_subscription(&self, subscription: &RefKey) -> StateResult<Option<SubscriptionRow>> {
        self.read(|txn| {
            let table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            get_row(&table, &ref_key(subscription))
        })
    }

    pub fn list_subscriptions(&self) -> StateResult<Vec<SubscriptionRow>> {
        self.read(|txn| {
            let table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            scan_rows(&table, "")
        })
    }

    /// Idle subscriptions whose cursor lags their topic head.
    pub fn subscriptions_with_backlog(&self) -> StateResult<Vec<SubscriptionRow>> {
        self.read(|txn| {
            let topics = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            let table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let mut lagging = Vec::new();
            for row in scan_rows::<SubscriptionRow, _>(&table, "")? {
                if row.state != SubscriptionState::Idle {
                    continue;
                }
                let head = get_row::<TopicRow, _>(&topics, &ref_key(&row.topic))?.map_or(0, |t| t.head);
                if row.cursor < head {
                    lagging.push(row);
                }
            }
            Ok(lagging)
        })
    }

    pub fn upsert_subscriber(
        &self,
        subscription: &RefKey,
        deployment: &DeploymentKey,
        sink: &RefKey,
        retry: RetryParams,
    ) -> StateResult<SubscriberRow> {
        let key = format!("{}{sink}", subscriber_prefix(subscription));
        let row = SubscriberRow {
            key: SubscriberKey::new(&subscription.module, &subscription.name),
            subscription: subscription.clone(),
            deployment: deployment.clone(),
            sink: sink.clone(),
            retry,
        };
        self.write(|txn| {
            let mut table = txn.open_table(SUBSCRIBERS).map_err(map_err!(Table))?;
            put_row(&mut table, &key, &row)
        })?;
        debug!(%subscription, %sink, "subscriber registered");
        Ok(row)
    }

    pub fn subscribers_for(&self, subscription: &RefKey) -> StateResult<Vec<SubscriberRow>> {
        self.read(|txn| {
            let table = txn.open_table(SUBSCRIBERS).map_err(map_err!(Table))?;
            scan_rows(&table, &subscriber_prefix(subscription))
        })
    }

    /// Remove the subscriptions still owned by `deployment` and every
    /// subscriber it registered. Returns the number of rows removed.
    pub fn delete_subscriptions_for_deployment(&self, deployment: &DeploymentKey) -> StateResult<usize> {
        let removed = self.write(|txn| {
            let mut removed = 0;
            let mut subscriptions = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let owned: Vec<String> = scan_rows::<SubscriptionRow, _>(&subscriptions, "")?
                .into_iter()
                .filter(|row| row.deployment == *deployment)
                .map(|row| ref_key(&row.reference()))
                .collect();
            for key in owned {
                subscriptions.remove(key.as_str()).map_err(map_err!(Write))?;
                removed += 1;
            }
            let mut subscribers = txn.open_table(SUBSCRIBERS).map_err(map_err!(Table))?;
            let mut owned = Vec::new();
            for entry in subscribers.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let row: SubscriberRow = super::decode(value.value())?;
                if row.deployment == *deployment {
                    owned.push(key.value().to_string());
                }
            }
            for key in owned {
                subscribers.remove(key.as_str()).map_err(map_err!(Write))?;
                removed += 1;
            }
            Ok(removed)
        })?;
        debug!(%deployment, removed, "subscriptions removed");
        Ok(removed)
    }

    /// Advance one subscription by one event.
    ///
    /// In a single transaction: skip the subscription if a delivery is in
    /// flight, find the next event, check it is older than `delay`, pick a
    /// subscriber with `pick(count)`, create the async call for it, move the
    /// cursor and mark the subscription as executing.
    pub fn progress_subscription(
        &self,
        subscription: &RefKey,
        now: DateTime<Utc>,
        delay: Duration,
        pick: impl FnOnce(usize) -> usize,
    ) -> StateResult<Progress> {
        let delay = chrono::Duration::from_std(delay).map_err(map_err!(Serialize))?;
        self.write(|txn| {
            let mut subscriptions = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let mut row: SubscriptionRow = get_row(&subscriptions, &ref_key(subscription))?
                .ok_or_else(|| StateError::NotFound(format!("subscription {subscription} not found")))?;
            if row.state == SubscriptionState::Executing {
                return Ok(Progress::Locked);
            }
            let head = {
                let topics = txn.open_table(TOPICS).map_err(map_err!(Table))?;
                get_row::<TopicRow, _>(&topics, &ref_key(&row.topic))?.map_or(0, |t| t.head)
            };
            if row.cursor >= head {
                return Ok(Progress::CaughtUp);
            }
            let event: TopicEvent = {
                let events = txn.open_table(TOPIC_EVENTS).map_err(map_err!(Table))?;
                get_row(&events, &event_key(&row.topic, row.cursor + 1))?.ok_or_else(|| {
                    StateError::NotFound(format!(
                        "event {} of topic {} not found",
                        row.cursor + 1,
                        row.topic
                    ))
                })?
            };
            if event.created_at + delay > now {
                return Ok(Progress::NotReady);
            }
            let candidates: Vec<SubscriberRow> = {
                let subscribers = txn.open_table(SUBSCRIBERS).map_err(map_err!(Table))?;
                scan_rows(&subscribers, &subscriber_prefix(subscription))?
            };
            if candidates.is_empty() {
                return Ok(Progress::NoSubscriber { event });
            }
            let subscriber = candidates[pick(candidates.len()).min(candidates.len() - 1)].clone();
            let call = insert_async_call(
                txn,
                &NewAsyncCall {
                    scheduled_at: now,
                    verb: subscriber.sink.clone(),
                    origin: AsyncOrigin::PubSub(subscription.clone()),
                    request: event.payload.clone(),
                    remaining_attempts: subscriber.retry.count,
                    backoff: subscriber.retry.min_backoff,
                    max_backoff: subscriber.retry.max_backoff,
                    catch_verb: subscriber.retry.catch.clone(),
                    catching: false,
                    parent_request_key: event.request_key.clone(),
                    trace_context: event.trace_context.clone(),
                },
                now,
            )?;
            row.cursor = event.seq;
            row.cursor_key = Some(event.key.clone());
            row.state = SubscriptionState::Executing;
            put_row(&mut subscriptions, &ref_key(subscription), &row)?;
            Ok(Progress::Dispatched {
                event,
                subscriber,
                call_id: call.id,
            })
        })
    }

    /// Release a subscription after its delivery finished, either way.
    pub fn complete_subscription_event(&self, subscription: &RefKey) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let Some(mut row) = get_row::<SubscriptionRow, _>(&table, &ref_key(subscription))? else {
                return Ok(());
            };
            row.state = SubscriptionState::Idle;
            put_row(&mut table, &ref_key(subscription), &row)
        })
    }

    /// Move a subscription's cursor to its topic's head. Deliveries already
    /// in flight are left alone.
    pub fn reset_subscription(&self, subscription: &RefKey) -> StateResult<SubscriptionRow> {
        let row = self.write(|txn| {
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let mut row: SubscriptionRow = get_row(&table, &ref_key(subscription))?
                .ok_or_else(|| StateError::NotFound(format!("subscription {subscription} not found")))?;
            let topics = txn.open_table(TOPICS).map_err(map_err!(Table))?;
            let topic = get_row::<TopicRow, _>(&topics, &ref_key(&row.topic))?
                .filter(|topic| topic.head > 0)
                .ok_or_else(|| {
                    StateError::FailedPrecondition(format!(
                        "no events published to topic {}",
                        row.topic.name
                    ))
                })?;
            row.cursor = topic.head;
            row.cursor_key = topic.head_key;
            put_row(&mut table, &ref_key(subscription), &row)?;
            Ok(row)
        })?;
        debug!(%subscription, cursor = row.cursor, "subscription reset");
        Ok(row)
    }
}
