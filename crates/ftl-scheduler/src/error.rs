//! Scheduler error types.

use ftl_core::{Code, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("lease {0} is held elsewhere")]
    LeaseHeld(String),

    #[error("state store error: {0}")]
    State(#[from] ftl_state::StateError),
}

impl ErrorCode for SchedulerError {
    fn code(&self) -> Code {
        match self {
            SchedulerError::LeaseHeld(_) => Code::Unavailable,
            SchedulerError::State(e) => e.code(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
