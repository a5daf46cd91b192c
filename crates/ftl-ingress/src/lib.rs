//! ftl-ingress: serves HTTP requests through ingress verbs.
//!
//! Verbs annotated `+ingress http METHOD /path` receive a
//! `builtin.HttpRequest` shaped from the incoming request and answer with a
//! `builtin.HttpResponse` that is unpacked back into HTTP. Routes come from
//! the active deployments and follow the routing table as it changes.

pub mod error;
pub mod request;
pub mod response;
pub mod route;
pub mod server;
pub mod service;

pub use error::{IngressError, IngressResult};
pub use request::{HttpParts, build_request};
pub use response::{HttpReply, unpack_response};
pub use route::{IngressRoute, IngressTable};
pub use server::{MAX_BODY_BYTES, router, serve};
pub use service::{IngressRequest, IngressService};
