//! Leases: short-lived named mutexes shared by controllers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ftl_core::Clock;
use ftl_state::{StateError, StateStore};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Default lease time to live.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Leaser: Send + Sync + 'static {
    /// Take or extend the lease `key` for `ttl`. Fails with
    /// [`SchedulerError::LeaseHeld`] while another holder's lease is live.
    async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Lease>;

    /// Give up a lease. Releasing a lease held by someone else is a no-op.
    async fn release(&self, lease: &Lease) -> SchedulerResult<()>;
}

/// Leases kept in the [`StateStore`], held under this controller's identity.
pub struct StoreLeaser {
    store: StateStore,
    holder: String,
    clock: Arc<dyn Clock>,
}

impl StoreLeaser {
    pub fn new(store: StateStore, holder: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            holder: holder.into(),
            clock,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl Leaser for StoreLeaser {
    async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Lease> {
        let now = self.clock.now();
        match self.store.acquire_lease(key, &self.holder, ttl, now) {
            Ok(row) => Ok(Lease {
                key: row.key,
                holder: row.holder,
                expires_at: row.expires_at,
            }),
            Err(StateError::LeaseHeld(key)) => Err(SchedulerError::LeaseHeld(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, lease: &Lease) -> SchedulerResult<()> {
        let released = self.store.release_lease(&lease.key, &lease.holder)?;
        debug!(key = %lease.key, released, "lease given up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ftl_core::ManualClock;

    use super::*;

    #[tokio::test]
    async fn a_live_lease_excludes_other_holders_until_it_expires() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let a = StoreLeaser::new(store.clone(), "ctr-a", clock.clone());
        let b = StoreLeaser::new(store.clone(), "ctr-b", clock.clone());

        let lease = a.acquire("reaper", DEFAULT_LEASE_TTL).await.unwrap();
        assert_eq!(lease.holder, "ctr-a");
        assert!(matches!(
            b.acquire("reaper", DEFAULT_LEASE_TTL).await,
            Err(SchedulerError::LeaseHeld(_))
        ));
        // The holder may extend its own lease.
        a.acquire("reaper", DEFAULT_LEASE_TTL).await.unwrap();

        clock.advance(Duration::from_secs(11));
        let taken = b.acquire("reaper", DEFAULT_LEASE_TTL).await.unwrap();
        assert_eq!(taken.holder, "ctr-b");

        a.release(&lease).await.unwrap();
        assert_eq!(store.get_lease("reaper").unwrap().unwrap().holder, "ctr-b");
        b.release(&taken).await.unwrap();
        assert!(store.get_lease("reaper").unwrap().is_none());
    }
}
