//! Cron jobs for verbs annotated with `+cron`.
//!
//! A job exists per (deployment, verb) while the deployment is active. Each
//! firing is an async call with a `cron:` origin, run by the async executor;
//! when it is finished for good the next firing is scheduled.

pub mod error;
pub mod service;

pub use error::{CronError, CronResult};
pub use service::{CronService, RESCAN_INTERVAL};
