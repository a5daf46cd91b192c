//! ftl-admin: config and secrets for modules.

pub mod error;
pub mod service;

pub use error::{AdminError, AdminResult};
pub use service::{AdminService, ListEntry, ValueRef};
