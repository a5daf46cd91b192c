//! Dispatch error types.

use ftl_core::{Code, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Unavailable(String),

    /// The verb ran and returned an error.
    #[error("{0}")]
    Verb(String),

    #[error(transparent)]
    Payload(#[from] ftl_schema::PayloadError),

    #[error("{0}")]
    Internal(String),
}

impl ErrorCode for DispatchError {
    fn code(&self) -> Code {
        match self {
            DispatchError::InvalidArgument(_) | DispatchError::Payload(_) => Code::InvalidArgument,
            DispatchError::NotFound(_) => Code::NotFound,
            DispatchError::PermissionDenied(_) => Code::PermissionDenied,
            DispatchError::Unavailable(_) => Code::Unavailable,
            DispatchError::Verb(_) | DispatchError::Internal(_) => Code::Internal,
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
