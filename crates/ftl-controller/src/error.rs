//! Controller error types.

use ftl_core::{Code, DeploymentKey, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("deployment {0} is already active")]
    AlreadyActive(DeploymentKey),

    #[error(transparent)]
    Schema(#[from] ftl_schema::SchemaErrors),

    #[error(transparent)]
    State(#[from] ftl_state::StateError),

    #[error(transparent)]
    Admin(#[from] ftl_admin::AdminError),
}

impl From<ftl_state::ClusterError> for ControllerError {
    fn from(err: ftl_state::ClusterError) -> Self {
        ControllerError::State(err.into())
    }
}

pub(crate) fn deployment_not_found(key: &DeploymentKey) -> ControllerError {
    ControllerError::NotFound(format!("deployment {key} not found"))
}

impl ErrorCode for ControllerError {
    fn code(&self) -> Code {
        match self {
            ControllerError::InvalidArgument(_) => Code::InvalidArgument,
            ControllerError::NotFound(_) => Code::NotFound,
            ControllerError::AlreadyActive(_) => Code::AlreadyExists,
            ControllerError::Schema(e) => e.code(),
            ControllerError::State(e) => e.code(),
            ControllerError::Admin(e) => e.code(),
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
