use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors that can escape the engine boundary. Pure evaluation never fails;
/// everything here comes from store reads or request handling.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ControlPlaneError::Database(e) => {
                tracing::error!(error = %e, "store read failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database error".to_string(),
                )
            }
            ControlPlaneError::Serialization(e) => {
                tracing::error!(error = %e, "serialization failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serialization error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
