//! redb table definitions for the FTL state store.
//!
//! Values are JSON-serialized domain types. Keys that need ordering embed
//! zero-padded sequence numbers, e.g. `{id:020}` or `{module}.{topic}/{seq:020}`.

use redb::TableDefinition;

/// Persisted deployment events keyed by `{seq:020}`, replayed at start.
pub const CLUSTER_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_events");

/// Artefact content keyed by hex digest.
pub const ARTEFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artefacts");

/// Async call rows keyed by `{id:020}`.
pub const ASYNC_CALLS: TableDefinition<&str, &[u8]> = TableDefinition::new("async_calls");

/// Topics keyed by `{module}.{topic}`.
pub const TOPICS: TableDefinition<&str, &[u8]> = TableDefinition::new("topics");

/// Topic events keyed by `{module}.{topic}/{seq:020}`.
pub const TOPIC_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("topic_events");

/// Subscriptions keyed by `{module}.{subscription}`.
pub const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");

/// Subscribers keyed by `{module}.{subscription}/{sink module}.{sink verb}`.
pub const SUBSCRIBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscribers");

/// Cron jobs keyed by `CronJobKey` text (`crn-{module}-{verb}-{suffix}`).
pub const CRON_JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("cron_jobs");

/// Leases keyed by lease name.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Config values keyed by `{module}/{name}`; global values use an empty module.
pub const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

/// Secret values, keyed like [`CONFIG`].
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Monotonic counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
