//! Error types for the FTL state store and cluster view.

use ftl_core::{Code, DeploymentKey, ErrorCode};
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("lease {0} is held by another controller")]
    LeaseHeld(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Errors raised while applying a cluster event to the view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("deployment {0} not found")]
    DeploymentNotFound(DeploymentKey),

    #[error("deployment {0}: min replicas must be greater than zero to activate")]
    InvalidReplicas(DeploymentKey),
}

impl ErrorCode for ClusterError {
    fn code(&self) -> Code {
        match self {
            ClusterError::DeploymentNotFound(_) => Code::NotFound,
            ClusterError::InvalidReplicas(_) => Code::InvalidArgument,
        }
    }
}

impl ErrorCode for StateError {
    fn code(&self) -> Code {
        match self {
            StateError::NotFound(_) => Code::NotFound,
            StateError::FailedPrecondition(_) => Code::FailedPrecondition,
            StateError::LeaseHeld(_) => Code::Unavailable,
            StateError::Cluster(e) => e.code(),
            _ => Code::Internal,
        }
    }
}
