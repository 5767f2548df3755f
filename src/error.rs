//! Error types for cardsink

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::StoreError;
use crate::services::extractor::ExtractError;
use crate::services::source_client::SourceError;

/// API error type for the HTTP surface.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Failures crossing the dispatcher boundary. Collaborator errors are mapped
/// here and only the taxonomy reaches the events table's error column.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("extraction: {0}")]
    Extraction(#[from] ExtractError),
}
