use ftl_core::{Code, ErrorCode};
use thiserror::Error;

pub type AdminResult<T> = Result<T, AdminError>;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("stored value is not valid JSON: {0}")]
    Encoding(String),

    #[error(transparent)]
    State(#[from] ftl_state::StateError),
}

impl ErrorCode for AdminError {
    fn code(&self) -> Code {
        match self {
            AdminError::InvalidArgument(_) => Code::InvalidArgument,
            AdminError::NotFound(_) => Code::NotFound,
            AdminError::Encoding(_) => Code::Internal,
            AdminError::State(e) => e.code(),
        }
    }
}
