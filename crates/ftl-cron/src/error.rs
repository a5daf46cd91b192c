//! Cron error types.

use ftl_core::{Code, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("{0}")]
    NotFound(String),

    #[error("failed to parse cron schedule {schedule:?}: {source}")]
    Schedule {
        schedule: String,
        source: ftl_schema::CronError,
    },

    #[error(transparent)]
    State(#[from] ftl_state::StateError),
}

impl ErrorCode for CronError {
    fn code(&self) -> Code {
        match self {
            CronError::NotFound(_) => Code::NotFound,
            CronError::Schedule { .. } => Code::InvalidArgument,
            CronError::State(e) => e.code(),
        }
    }
}

pub type CronResult<T> = Result<T, CronError>;
