//! Error types for the broker service.
//!
//! `AppError` implements `IntoResponse` so handlers can use `?` directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use floe_core::CoreError;
use floe_store::StoreError;

/// Application-level errors for the broker.
#[derive(Error, Debug)]
pub enum AppError {
    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Core (validation/template/parse) error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Store(StoreError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, msg.clone())
            }
            AppError::Store(StoreError::TerminalRecorded(id)) => (
                StatusCode::CONFLICT,
                format!("Execution {} already terminated", id),
            ),
            AppError::Store(StoreError::DuplicateEvent { .. })
            | AppError::Store(StoreError::Conflict(_)) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Core(CoreError::Validation(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            AppError::Core(CoreError::Parse(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Core(err) => {
                tracing::error!(error = %err, "Core error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;
