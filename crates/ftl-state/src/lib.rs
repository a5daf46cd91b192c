//! ftl-state: cluster state and persistence for the FTL control plane.
//!
//! - [`stream`]: a generic single-writer event stream reducing events into a view
//! - [`cluster`]: the cluster view (deployments, runners, artefacts) and its events
//! - [`store`]: the redb-backed [`StateStore`] holding everything that must
//!   outlive the process: deployment events, artefacts, async calls, topics
//!   and subscriptions, cron jobs, leases, config and secrets
//!
//! The `StateStore` is `Clone + Send + Sync` (backed by `Arc<Database>`) and
//! can be shared across async tasks.

pub mod cluster;
pub mod error;
pub mod store;
pub mod stream;
pub mod tables;
pub mod types;

pub use cluster::{ClusterEvent, ClusterState, ClusterView, Deployment, DeploymentArtefact, Runner};
pub use error::{ClusterError, StateError, StateResult};
pub use store::StateStore;
pub use stream::{EventStream, StreamEvent, Subscription};
pub use types::*;
