//! ftl-controller: the control plane's deployment, runner, schema and
//! deployment context services.
//!
//! - [`service`]: the [`ControllerService`] and its status reports
//! - [`deployments`]: create, activate, replace and inspect deployments, and
//!   move their artefacts
//! - [`runners`]: runner registration streams, log intake and the reaper
//! - [`schema`]: the current schema and the schema change stream
//! - [`context`]: per-deployment runtime contexts

pub mod context;
pub mod deployments;
pub mod error;
pub mod runners;
pub mod schema;
pub mod service;

pub use context::DeploymentContext;
pub use deployments::{ArtefactChunk, CreateDeployment, RuntimeUpdate};
pub use error::{ControllerError, ControllerResult};
pub use runners::{Heartbeat, LogLine};
pub use schema::{ChangeType, SchemaUpdate};
pub use service::{
    ControllerService, ControllerStatus, DeploymentStatus, Process, ProcessRunner, RunnerStatus,
    Status,
};
