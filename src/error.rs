//! Service-level error type.
//!
//! Covers persistence, configuration and admin-surface failures. Request-path
//! failures produced inside the proxy attempt loop use `proxy::ProxyError`
//! instead; both converge on the same `{"error": {...}}` envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            AppError::Database(e) => {
                crate::logger::error("app", &format!("database error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            AppError::Io(e) => {
                crate::logger::error("app", &format!("io error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            AppError::JsonSerialization(e) => {
                crate::logger::error("app", &format!("json error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            AppError::Config(msg) => {
                crate::logger::error("app", &format!("config error: {}", msg));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "authentication_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::Internal(msg) => {
                crate::logger::error("app", &format!("internal error: {}", msg));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        (
            status,
            Json(ErrorBody {
                error: ErrorDetail {
                    message: self.to_string(),
                    kind,
                },
            }),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
