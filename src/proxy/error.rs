//! Request-path error type for the proxy engine (C7).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Errors produced while serving one client request through the attempt loop.
#[derive(Debug, Clone)]
pub enum ProxyError {
    /// Missing or unknown API key (never retried).
    Unauthorized(String),
    /// Key valid but not authorized for the requested group (never retried).
    Forbidden(String),
    /// Request body didn't match the declared dialect (never retried).
    Validation(String),
    /// Upstream returned a non-2xx status, transport failed, body was empty,
    /// or the sentinel matched — all soft failures that trigger a retry.
    UpstreamFailed(String),
    /// Selector found no eligible provider across every tier (never retried).
    Exhausted,
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            ProxyError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            ProxyError::Validation(msg) => write!(f, "validation error: {}", msg),
            ProxyError::UpstreamFailed(msg) => write!(f, "upstream failed: {}", msg),
            ProxyError::Exhausted => {
                write!(f, "All suitable providers failed or are unavailable.")
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ProxyError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "authentication_error", msg.clone())
            }
            ProxyError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, "permission_denied_error", msg.clone())
            }
            ProxyError::Validation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", msg.clone())
            }
            // upstream-passthrough: reported as 503, upstream text stays in the call log only
            ProxyError::UpstreamFailed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_error",
                "All suitable providers failed or are unavailable.".to_string(),
            ),
            ProxyError::Exhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_error",
                "All suitable providers failed or are unavailable.".to_string(),
            ),
        };

        crate::logger::error(
            "proxy",
            &format!("returning error: status={}, type={}, detail={}", status.as_u16(), kind, self),
        );

        (
            status,
            Json(serde_json::json!({
                "error": { "type": kind, "message": message }
            })),
        )
            .into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
