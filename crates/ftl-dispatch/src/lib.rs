//! ftl-dispatch: routes verb calls to the runners serving them.
//!
//! [`Dispatcher::call`] resolves the verb in the live schema, checks that the
//! caller may call it, validates the request body and forwards the call to
//! the runner currently serving the module through a cached [`VerbClient`].
//! Every call that gets as far as a known verb is recorded on the timeline.

pub mod cache;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod headers;

pub use cache::{ClientCache, ClientFactory, DEFAULT_CLIENT_TTL};
pub use client::{HttpVerbClient, VERB_PATH_PREFIX, VerbClient, VerbRequest};
pub use dispatcher::{CallRequest, Dispatcher};
pub use error::{DispatchError, DispatchResult};
pub use headers::{
    CallContext, DIRECT_ROUTING_HEADER, PARENT_REQUEST_ID_HEADER, REQUEST_ID_HEADER, VERB_HEADER,
};
