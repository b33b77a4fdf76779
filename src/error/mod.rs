use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

/// Coarse error classification surfaced to callers of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Unavailable,
    InvalidArgument,
    Transient,
    Expired,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Transient => "TRANSIENT",
            ErrorCode::Expired => "EXPIRED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum MessagerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Transient(#[from] StorageError),

    #[error("message {id} exceeded max epoch {max_epoch}")]
    Expired { id: String, max_epoch: i64 },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MessagerError {
    pub fn table_not_found(table: &str) -> Self {
        MessagerError::NotFound(format!("message table {} not found", table))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            MessagerError::NotFound(_) => ErrorCode::NotFound,
            MessagerError::Unavailable(_) => ErrorCode::Unavailable,
            MessagerError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            MessagerError::Transient(_) => ErrorCode::Transient,
            MessagerError::Expired { .. } => ErrorCode::Expired,
            MessagerError::Config(_) | MessagerError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for MessagerError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = match code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();

        tracing::error!(
            code = %code.as_str(),
            status = %status.as_u16(),
            message = %message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.as_str().to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MessagerError>;
