//! Error types and handling for the gateway.
//!
//! [`AppError`] is the user-visible error taxonomy. Every variant renders as
//! `{"error": "[<tag>] <message>"}` with the HTTP status the taxonomy
//! assigns. Upstream pass-through responses are NOT errors: a non-2xx
//! upstream body is surfaced verbatim by the handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the request pipeline.
#[derive(Error, Debug)]
pub enum AppError {
    /// No credential, malformed credential, or unknown key hash.
    #[error("api key is not registered")]
    Unauthenticated,

    /// The key exists but has been revoked.
    #[error("api key has been revoked")]
    Revoked,

    /// The key's allowed paths exclude the requested path.
    #[error("path is not allowed for this api key")]
    PathNotAllowed,

    /// Unknown route or provider setting.
    #[error("{0}")]
    NotFound(String),

    /// Request-per-window or token-per-window limit hit.
    #[error("rate limit exceeded")]
    RateExceeded,

    /// Spend ceiling hit.
    #[error("cost limit exceeded")]
    CostExceeded,

    /// Outer deadline or final step timeout.
    #[error("request timeout")]
    RequestTimeout,

    /// Buffered route body exceeded the configured bound.
    #[error("request body too large")]
    PayloadTooLarge,

    /// Limit store unreachable while running fail-closed.
    #[error("limit backend unavailable")]
    LimitBackendUnavailable,

    /// Catch-all for unexpected failures in parsing or dispatch.
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable tag, used in error bodies and telemetry.
    pub fn tag(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::Revoked => "revoked",
            AppError::PathNotAllowed => "path_not_allowed",
            AppError::NotFound(_) => "not_found",
            AppError::RateExceeded => "rate_exceeded",
            AppError::CostExceeded => "cost_exceeded",
            AppError::RequestTimeout => "request_timeout",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::LimitBackendUnavailable => "limit_backend_unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated | AppError::Revoked => StatusCode::UNAUTHORIZED,
            AppError::PathNotAllowed => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateExceeded | AppError::CostExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::LimitBackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": format!("[{}] {}", self.tag(), self),
        }));
        (self.status(), body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Revoked.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::PathNotAllowed.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::NotFound("route not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::RateExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AppError::CostExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AppError::RequestTimeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            AppError::LimitBackendUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_tag_is_stable() {
        assert_eq!(AppError::RateExceeded.tag(), "rate_exceeded");
        assert_eq!(AppError::CostExceeded.tag(), "cost_exceeded");
        assert_eq!(AppError::Unauthenticated.tag(), "unauthenticated");
    }

    #[test]
    fn test_error_into_response() {
        let response = AppError::RateExceeded.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_error_body_format() {
        let response = AppError::RateExceeded.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "[rate_exceeded] rate limit exceeded");
    }
}
