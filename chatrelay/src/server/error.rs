//! HTTP-level errors for the API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::api::ErrorBody;
use crate::db::DbError;

/// Errors returned as JSON before a response stream has started.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad input shape. Nothing was written.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Unknown conversation.
    #[error("Conversation not found")]
    NotFound,

    /// Storage failed on a read the request cannot proceed without.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            Self::Storage(e) => {
                tracing::error!(error = %e, "request failed on storage");
                "Internal Server Error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(
            ApiError::InvalidPayload("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Storage(DbError::InvalidRow("bad".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
