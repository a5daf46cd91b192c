//! StateStore: redb-backed persistence for the FTL control plane.
//!
//! Values are JSON-serialized into `&[u8]` columns. Operations that must be
//! atomic with respect to each other (claiming an async call, advancing a
//! subscription cursor together with creating its delivery) run inside one
//! write transaction; redb serialises writers, which gives the row-level
//! exclusion progression relies on.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ftl_core::Digest;
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cluster::ClusterEvent;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

mod async_calls;
mod cron;
mod pubsub;

type JsonTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            for table in [
                CLUSTER_EVENTS,
                ARTEFACTS,
                ASYNC_CALLS,
                TOPICS,
                TOPIC_EVENTS,
                SUBSCRIPTIONS,
                SUBSCRIBERS,
                CRON_JOBS,
                LEASES,
                CONFIG,
                SECRETS,
            ] {
                txn.open_table(table).map_err(map_err!(Table))?;
            }
            txn.open_table(META).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    fn read<R>(&self, f: impl FnOnce(&ReadTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&txn)
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    // ── Cluster events ─────────────────────────────────────────────

    /// Append deployment events to the replay log in one transaction.
    pub fn append_cluster_events<'a>(
        &self,
        events: impl IntoIterator<Item = &'a ClusterEvent>,
    ) -> StateResult<()> {
        self.write(|txn| {
            for event in events {
                let seq = next_id(txn, "cluster_events")?;
                let mut table = txn.open_table(CLUSTER_EVENTS).map_err(map_err!(Table))?;
                put_row(&mut table, &format!("{seq:020}"), event)?;
            }
            Ok(())
        })
    }

    /// Every persisted cluster event in append order.
    pub fn cluster_events(&self) -> StateResult<Vec<ClusterEvent>> {
        self.read(|txn| {
            let table = txn.open_table(CLUSTER_EVENTS).map_err(map_err!(Table))?;
            scan_rows(&table, "")
        })
    }

    // ── Artefacts ──────────────────────────────────────────────────

    /// Store content-addressed bytes. Storing the same content twice is a no-op.
    pub fn put_artefact(&self, content: &[u8]) -> StateResult<Digest> {
        let digest = Digest::of(content);
        let key = digest.to_string();
        self.write(|txn| {
            let mut table = txn.open_table(ARTEFACTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), content)
                .map_err(map_err!(Write))?;
            Ok(())
        })?;
        debug!(%digest, size = content.len(), "artefact stored");
        Ok(digest)
    }

    pub fn get_artefact(&self, digest: &Digest) -> StateResult<Option<Vec<u8>>> {
        let key = digest.to_string();
        self.read(|txn| {
            let table = txn.open_table(ARTEFACTS).map_err(map_err!(Table))?;
            Ok(table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }

    /// The subset of `digests` that is not stored, in input order.
    pub fn missing_artefacts(&self, digests: &[Digest]) -> StateResult<Vec<Digest>> {
        self.read(|txn| {
            let table = txn.open_table(ARTEFACTS).map_err(map_err!(Table))?;
            let mut missing = Vec::new();
            for digest in digests {
                let key = digest.to_string();
                if table.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
                    missing.push(*digest);
                }
            }
            Ok(missing)
        })
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Take or extend a lease. Fails with [`StateError::LeaseHeld`] while
    /// another holder's lease is unexpired.
    pub fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StateResult<LeaseRow> {
        let ttl = chrono::Duration::from_std(ttl).map_err(map_err!(Serialize))?;
        self.write(|txn| {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            if let Some(current) = get_row::<LeaseRow, _>(&table, key)? {
                if current.holder != holder && current.expires_at > now {
                    return Err(StateError::LeaseHeld(key.to_string()));
                }
            }
            let lease = LeaseRow {
                key: key.to_string(),
                holder: holder.to_string(),
                expires_at: now + ttl,
            };
            put_row(&mut table, key, &lease)?;
            Ok(lease)
        })
    }

    /// Release a lease if `holder` still owns it. Returns true if released.
    pub fn release_lease(&self, key: &str, holder: &str) -> StateResult<bool> {
        let released = self.write(|txn| {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match get_row::<LeaseRow, _>(&table, key)? {
                Some(current) if current.holder == holder => {
                    table.remove(key).map_err(map_err!(Write))?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        debug!(%key, released, "lease released");
        Ok(released)
    }

    pub fn get_lease(&self, key: &str) -> StateResult<Option<LeaseRow>> {
        self.read(|txn| {
            let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            get_row(&table, key)
        })
    }

    // ── Config and secrets ─────────────────────────────────────────

    pub fn put_value(
        &self,
        kind: ValueKind,
        module: Option<&str>,
        name: &str,
        value: &[u8],
    ) -> StateResult<()> {
        let key = value_key(module, name);
        self.write(|txn| {
            let mut table = txn.open_table(value_table(kind)).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value)
                .map_err(map_err!(Write))?;
            Ok(())
        })?;
        debug!(kind = kind.as_str(), %key, "value stored");
        Ok(())
    }

    pub fn get_value(
        &self,
        kind: ValueKind,
        module: Option<&str>,
        name: &str,
    ) -> StateResult<Option<Vec<u8>>> {
        let key = value_key(module, name);
        self.read(|txn| {
            let table = txn.open_table(value_table(kind)).map_err(map_err!(Table))?;
            Ok(table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }

    /// Delete a value. Returns true if it existed.
    pub fn delete_value(&self, kind: ValueKind, module: Option<&str>, name: &str) -> StateResult<bool> {
        let key = value_key(module, name);
        let existed = self.write(|txn| {
            let mut table = txn.open_table(value_table(kind)).map_err(map_err!(Table))?;
            Ok(table.remove(key.as_str()).map_err(map_err!(Write))?.is_some())
        })?;
        debug!(kind = kind.as_str(), %key, existed, "value deleted");
        Ok(existed)
    }

    /// All values of a kind, global values first, then by module and name.
    pub fn list_values(&self, kind: ValueKind) -> StateResult<Vec<StoredValue>> {
        self.read(|txn| {
            let table = txn.open_table(value_table(kind)).map_err(map_err!(Table))?;
            let mut values = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let Some((module, name)) = key.value().split_once('/') else {
                    continue;
                };
                values.push(StoredValue {
                    module: (!module.is_empty()).then(|| module.to_string()),
                    name: name.to_string(),
                    value: value.value().to_vec(),
                });
            }
            Ok(values)
        })
    }
}

fn value_table(kind: ValueKind) -> redb::TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        ValueKind::Config => CONFIG,
        ValueKind::Secret => SECRETS,
    }
}

fn value_key(module: Option<&str>, name: &str) -> String {
    format!("{}/{name}", module.unwrap_or_default())
}

// ── Row helpers ────────────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_row<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Rows whose key starts with `prefix`, in key order.
fn scan_rows<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

fn put_row<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Bump and return a named counter. The first value is 1.
fn next_id(txn: &WriteTransaction, counter: &str) -> StateResult<u64> {
    let mut table = txn.open_table(META).map_err(map_err!(Table))?;
    let next = table
        .get(counter)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    table.insert(counter, next).map_err(map_err!(Write))?;
    Ok(next)
}
