use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application error types
///
/// Every user-visible failure carries a stable classification string
/// (see [`error_type_name`]) alongside the human-readable message, so
/// clients can branch on cause without parsing messages.
#[derive(Debug)]
pub enum AppError {
    /// Request rejected by the rate limiter before any channel was touched
    RateLimited { retry_after: u64 },
    /// Caller-supplied request failed validation
    InvalidRequest(String),
    /// No eligible channel for the requested model (terminal, never retried)
    NoChannelAvailable(String),
    /// Upstream returned an error-shaped payload or non-2xx status
    Upstream { status: StatusCode, message: String },
    /// Every relay attempt failed; wraps the last attempt's error
    RelayExhausted { attempts: u32, last: Box<AppError> },
    /// Upstream call exceeded its bounded timeout
    Timeout(String),
    /// HTTP transport error (preserves reqwest::Error for failure classification)
    HttpRequest(reqwest::Error),
    /// Coordination store operation failed
    Store(String),
    /// Durable store operation failed
    Database(String),
    /// Authentication error
    Unauthorized(String),
    /// Requested entity does not exist
    NotFound(String),
    /// Configuration error
    Config(String),
    /// Internal server error
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after } => {
                write!(f, "Rate limit exceeded, retry after {}s", retry_after)
            }
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::NoChannelAvailable(msg) => write!(f, "No channel available: {}", msg),
            Self::Upstream { status, message } => {
                write!(f, "Upstream error ({}): {}", status, message)
            }
            Self::RelayExhausted { attempts, last } => {
                write!(f, "All {} attempts failed: {}", attempts, last)
            }
            Self::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Self::HttpRequest(err) => write!(f, "HTTP request error: {}", err),
            Self::Store(msg) => write!(f, "Coordination store error: {}", msg),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Stable machine-readable classification for each error variant
pub fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::RateLimited { .. } => "rate_limited",
        AppError::InvalidRequest(_) => "invalid_request_error",
        AppError::NoChannelAvailable(_) => "no_channel_available",
        AppError::Upstream { .. } => "upstream_error",
        // Clients care about what went wrong, not that a budget ran out
        AppError::RelayExhausted { last, .. } => error_type_name(last),
        AppError::Timeout(_) => "timeout",
        AppError::HttpRequest(_) => "http_request_error",
        AppError::Store(_) => "store_error",
        AppError::Database(_) => "database_error",
        AppError::Unauthorized(_) => "unauthorized",
        AppError::NotFound(_) => "not_found",
        AppError::Config(_) => "config_error",
        AppError::Internal(_) => "internal_error",
    }
}

/// HTTP status and client-facing message for a variant. Exhausted relays
/// surface the last attempt's cause.
fn response_parts(error: &AppError) -> (StatusCode, String) {
    match error {
        AppError::RateLimited { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            format!("Rate limit exceeded, retry after {}s", retry_after),
        ),
        AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        AppError::NoChannelAvailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        AppError::Upstream { status, message } => (*status, message.clone()),
        AppError::RelayExhausted { last, .. } => response_parts(last),
        AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
        AppError::HttpRequest(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        AppError::Store(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        AppError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
        AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = response_parts(&self);

        let retry_after = match &self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let attempts = match &self {
            Self::RelayExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type_name(&self),
                "retry_after": retry_after,
                "attempts": attempts,
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::HttpRequest(err)
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AppError::NoChannelAvailable("all channels cooling".to_string());
        assert_eq!(
            error.to_string(),
            "No channel available: all channels cooling"
        );
    }

    #[test]
    fn test_error_type_name() {
        assert_eq!(
            error_type_name(&AppError::RateLimited { retry_after: 60 }),
            "rate_limited"
        );
        assert_eq!(
            error_type_name(&AppError::NoChannelAvailable("x".to_string())),
            "no_channel_available"
        );
        assert_eq!(
            error_type_name(&AppError::Timeout("poll".to_string())),
            "timeout"
        );
    }

    #[test]
    fn test_exhausted_relay_delegates_classification() {
        let error = AppError::RelayExhausted {
            attempts: 3,
            last: Box::new(AppError::Upstream {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "over capacity".to_string(),
            }),
        };
        assert_eq!(error_type_name(&error), "upstream_error");
        assert_eq!(
            error.to_string(),
            "All 3 attempts failed: Upstream error (503 Service Unavailable): over capacity"
        );
    }

    #[tokio::test]
    async fn test_exhausted_relay_uses_inner_status() {
        let error = AppError::RelayExhausted {
            attempts: 2,
            last: Box::new(AppError::Timeout("submission timed out".to_string())),
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let error = AppError::RateLimited { retry_after: 30 };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_no_channel_response() {
        let error = AppError::NoChannelAvailable("none eligible".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
