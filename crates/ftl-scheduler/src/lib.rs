//! ftl-scheduler: background jobs for the controller.
//!
//! [`Scheduler`] runs named jobs with jittered exponential backoff. Singleton
//! jobs are guarded by a [`Leaser`] so only one controller runs them at a
//! time; [`StoreLeaser`] keeps those leases in the state store.

pub mod backoff;
pub mod error;
pub mod lease;
pub mod scheduler;

pub use backoff::Backoff;
pub use error::{SchedulerError, SchedulerResult};
pub use lease::{DEFAULT_LEASE_TTL, Lease, Leaser, StoreLeaser};
pub use scheduler::{JobHandle, Scheduler, SchedulerOptions};
