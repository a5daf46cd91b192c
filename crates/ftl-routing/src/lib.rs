//! ftl-routing: which endpoint serves each module.
//!
//! [`Routes`] is an immutable snapshot mapping module to active deployment to
//! endpoint, carrying the schema of the active deployments alongside.
//! [`RouteTable`] keeps the latest snapshot in step with the cluster state.

pub mod routes;
pub mod table;

pub use routes::{Route, Routes};
pub use table::RouteTable;
