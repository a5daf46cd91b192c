//! Pub/sub error types.

use ftl_core::{Code, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    State(#[from] ftl_state::StateError),

    #[error("failed to encode catch request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ErrorCode for PubSubError {
    fn code(&self) -> Code {
        match self {
            PubSubError::InvalidArgument(_) => Code::InvalidArgument,
            PubSubError::NotFound(_) => Code::NotFound,
            PubSubError::State(e) => e.code(),
            PubSubError::Encode(_) => Code::Internal,
        }
    }
}

pub type PubSubResult<T> = Result<T, PubSubError>;
