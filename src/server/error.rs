//! API error type and HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::providers::ProviderError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    pub message: String,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        tracing::error!(target: "durable_fanout::server", error = %e, "provider error");
        if e.is_retryable() {
            Self::new(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}
