use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The background initializer has not finished yet; callers may retry.
    #[error("not ready: {0}")]
    NotReady(String),
    /// Initialization failed for good; carries the stored startup error.
    #[error("startup failed: {0}")]
    StartupFailed(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::NotReady(_))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::StartupFailed(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("AI startup error: {}", msg),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({ "error": message, "retryable": self.is_retryable() }));
        (status, body).into_response()
    }
}
