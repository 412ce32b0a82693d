//! Application error types and HTTP response mapping.
//!
//! Defines `AppError` for every condition the intake API can report and
//! implements Axum's `IntoResponse` so handlers return JSON error bodies.
//!
//! Error mappings:
//! - `OperationNotFound` → 404
//! - `InvalidRequest` → 400
//! - `Store` → 500
//!
//! The lower layers have their own error enums (`StoreError`, `GitError`,
//! `ConfigError`); only the store error crosses into HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::OperationNotFound(uuid) => {
                (StatusCode::NOT_FOUND, format!("Operation not found: {}", uuid))
            }
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, format!("Invalid request: {}", msg))
            }
        };

        if status.is_server_error() {
            tracing::error!("{}", error_message);
        }

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
