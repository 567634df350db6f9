//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type, mapped from `deploy_core::Error` at the HTTP boundary.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<deploy_core::Error> for ApiError {
    fn from(err: deploy_core::Error) -> Self {
        match err {
            deploy_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            deploy_core::Error::InvalidRequest(msg) => ApiError::BadRequest(msg),
            deploy_core::Error::Cancelled => ApiError::Conflict("deployment cancelled".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
