//! Ingress error types.

use ftl_core::{Code, ErrorCode};
use ftl_dispatch::DispatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("route not found")]
    RouteNotFound,

    /// The HTTP request can not be shaped into the verb's request.
    #[error("{0}")]
    BadRequest(String),

    /// The verb's response can not be turned into an HTTP response.
    #[error("{0}")]
    BadResponse(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ErrorCode for IngressError {
    fn code(&self) -> Code {
        match self {
            IngressError::RouteNotFound => Code::NotFound,
            IngressError::BadRequest(_) => Code::InvalidArgument,
            IngressError::BadResponse(_) => Code::Internal,
            IngressError::Dispatch(e) => e.code(),
        }
    }
}

pub type IngressResult<T> = Result<T, IngressError>;
