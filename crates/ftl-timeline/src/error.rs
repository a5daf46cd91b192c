use ftl_core::{Code, ErrorCode};
use thiserror::Error;

pub type TimelineResult<T> = Result<T, TimelineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("timeline unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for TimelineError {
    fn code(&self) -> Code {
        match self {
            TimelineError::InvalidArgument(_) => Code::InvalidArgument,
            TimelineError::Unavailable(_) => Code::Unavailable,
        }
    }
}
