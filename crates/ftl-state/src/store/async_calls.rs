use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use tracing::debug;

use super::{StateStore, get_row, next_id, put_row, scan_rows};
use crate::error::{StateError, StateResult};
use crate::tables::ASYNC_CALLS;
use crate::types::{AsyncCall, AsyncCallState, AsyncOrigin, NewAsyncCall};

fn row_key(id: u64) -> String {
    format!("{id:020}")
}

/// Insert a pending async call inside an open transaction.
pub(super) fn insert_async_call(
    txn: &WriteTransaction,
    call: &NewAsyncCall,
    now: DateTime<Utc>,
) -> StateResult<AsyncCall> {
    let id = next_id(txn, "async_calls")?;
    let row = AsyncCall::from_new(id, now, call);
    let mut table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
    put_row(&mut table, &row_key(id), &row)?;
    debug!(id, verb = %row.verb, origin = %row.origin, scheduled_at = %row.scheduled_at, "async call created");
    Ok(row)
}

impl StateStore {
    pub fn create_async_call(&self, call: &NewAsyncCall, now: DateTime<Utc>) -> StateResult<AsyncCall> {
        self.write(|txn| insert_async_call(txn, call, now))
    }

    pub fn get_async_call(&self, id: u64) -> StateResult<Option<AsyncCall>> {
        self.read(|txn| {
            let table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
            get_row(&table, &row_key(id))
        })
    }

    /// Every attempt ever recorded, oldest first.
    pub fn list_async_calls(&self) -> StateResult<Vec<AsyncCall>> {
        self.read(|txn| {
            let table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
            scan_rows(&table, "")
        })
    }

    pub fn async_calls_for_origin(&self, origin: &AsyncOrigin) -> StateResult<Vec<AsyncCall>> {
        Ok(self
            .list_async_calls()?
            .into_iter()
            .filter(|call| call.origin == *origin)
            .collect())
    }

    /// Claim the earliest pending call due at `now`, marking it executing
    /// under a lease that expires after `lease`.
    pub fn acquire_async_call(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StateResult<Option<AsyncCall>> {
        let lease = chrono::Duration::from_std(lease).map_err(map_err!(Serialize))?;
        self.write(|txn| {
            let mut table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
            let rows: Vec<AsyncCall> = scan_rows(&table, "")?;
            let Some(mut call) = rows
                .into_iter()
                .filter(|call| call.state == AsyncCallState::Pending && call.scheduled_at <= now)
                .min_by_key(|call| (call.scheduled_at, call.id))
            else {
                return Ok(None);
            };
            call.state = AsyncCallState::Executing;
            call.lease_expires_at = Some(now + lease);
            put_row(&mut table, &row_key(call.id), &call)?;
            debug!(id = call.id, verb = %call.verb, "async call acquired");
            Ok(Some(call))
        })
    }

    /// Record the outcome of an executing call.
    pub fn complete_async_call(
        &self,
        id: u64,
        outcome: Result<Vec<u8>, String>,
    ) -> StateResult<AsyncCall> {
        self.write(|txn| {
            let mut table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
            let mut call: AsyncCall = get_row(&table, &row_key(id))?
                .ok_or_else(|| StateError::NotFound(format!("async call {id} not found")))?;
            if call.state != AsyncCallState::Executing {
                return Err(StateError::FailedPrecondition(format!(
                    "async call {id} is not executing"
                )));
            }
            call.lease_expires_at = None;
            match outcome {
                Ok(response) => {
                    call.state = AsyncCallState::Success;
                    call.response = Some(response);
                }
                Err(error) => {
                    call.state = AsyncCallState::Error;
                    call.error = Some(error);
                }
            }
            put_row(&mut table, &row_key(id), &call)?;
            Ok(call)
        })
    }

    /// Executing calls whose lease ran out before `now`, oldest first.
    pub fn expired_async_calls(&self, now: DateTime<Utc>, limit: usize) -> StateResult<Vec<AsyncCall>> {
        self.read(|txn| {
            let table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
            let rows: Vec<AsyncCall> = scan_rows(&table, "")?;
            Ok(rows
                .into_iter()
                .filter(|call| {
                    call.state == AsyncCallState::Executing
                        && call.lease_expires_at.is_some_and(|expiry| expiry < now)
                })
                .take(limit)
                .collect())
        })
    }

    /// When the earliest pending call becomes due.
    pub fn next_async_call_due(&self) -> StateResult<Option<DateTime<Utc>>> {
        self.read(|txn| {
            let table = txn.open_table(ASYNC_CALLS).map_err(map_err!(Table))?;
            let mut earliest: Option<DateTime<Utc>> = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let call: AsyncCall = super::decode(value.value())?;
                if call.state == AsyncCallState::Pending {
                    earliest = Some(earliest.map_or(call.scheduled_at, |e| e.min(call.scheduled_at)));
                }
            }
            Ok(earliest)
        })
    }
}
