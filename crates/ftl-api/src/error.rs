//! Boundary errors. Every service error carries a [`Code`], which picks the
//! HTTP status.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ftl_core::{Code, ErrorCode};
use thiserror::Error;

use crate::ApiResponse;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: Code,
    pub message: String,
}

impl ApiError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }
}

impl ErrorCode for ApiError {
    fn code(&self) -> Code {
        self.code
    }
}

macro_rules! from_service_error {
    ($($error:ty),* $(,)?) => {
        $(
            impl From<$error> for ApiError {
                fn from(e: $error) -> Self {
                    ApiError::new(e.code(), e.to_string())
                }
            }
        )*
    };
}

from_service_error!(
    ftl_controller::ControllerError,
    ftl_admin::AdminError,
    ftl_dispatch::DispatchError,
    ftl_pubsub::PubSubError,
    ftl_timeline::TimelineError,
);

impl From<ftl_core::KeyError> for ApiError {
    fn from(e: ftl_core::KeyError) -> Self {
        ApiError::invalid(format!("invalid key: {e}"))
    }
}

impl From<ftl_core::DigestError> for ApiError {
    fn from(e: ftl_core::DigestError) -> Self {
        ApiError::invalid(format!("invalid digest: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            code: Some(self.code.as_str()),
            error: Some(self.message),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
