// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::executor::ScopeError;
use crate::guard::GuardError;
use crate::pool::PoolError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 503 Service Unavailable
    ServiceUnavailable { message: String, retryable: bool },
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::InternalServerError(_) => 500,
            ApiError::ServiceUnavailable { .. } => 503,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::Unauthorized(msg) => msg,
            ApiError::Forbidden(msg) => msg,
            ApiError::InternalServerError(msg) => msg,
            ApiError::ServiceUnavailable { message, .. } => message,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::ServiceUnavailable { retryable: true, .. })
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "success": false,
            "error": self.message(),
            "code": self.error_code()
        });
        if self.is_retryable() {
            body["retryable"] = json!(true);
        }
        body
    }
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn service_busy(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable {
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::InvalidSecret | GuardError::Signing(_) => {
                tracing::error!("Credential verification misconfigured: {}", err);
                ApiError::internal_server_error("Authentication is unavailable")
            }
            other => {
                tracing::debug!("Authentication denied: {}", other);
                ApiError::unauthorized(other.to_string())
            }
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        if err.is_retryable() {
            tracing::warn!("Session pool busy: {}", err);
            return ApiError::service_busy("Service busy, please retry shortly");
        }
        tracing::error!("Session pool unavailable: {}", err);
        ApiError::service_unavailable("Database temporarily unavailable")
    }
}

impl From<ScopeError> for ApiError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Pool(pool_err) => pool_err.into(),
            other => {
                // Don't expose internal causes to clients
                tracing::error!("Scoped database work failed: {}", other);
                ApiError::internal_server_error("An error occurred while processing your request")
            }
        }
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionError;
    use std::time::Duration;

    #[test]
    fn credential_failures_are_unauthorized() {
        for err in [
            GuardError::MissingCredential,
            GuardError::MissingTenantClaim,
            GuardError::ExpiredCredential,
            GuardError::InvalidTenantFormat("x".to_string()),
        ] {
            assert_eq!(ApiError::from(err).status_code(), 401);
        }
    }

    #[test]
    fn pool_timeout_is_retryable_busy() {
        let api: ApiError = ScopeError::Pool(PoolError::PoolTimeout(Duration::from_millis(50))).into();
        assert_eq!(api.status_code(), 503);
        assert!(api.is_retryable());
        assert_eq!(api.to_json()["retryable"], json!(true));
    }

    #[test]
    fn internal_causes_are_hidden() {
        let api: ApiError =
            ScopeError::Session(SessionError::UnscopedAccessViolation("SELECT * FROM secrets".to_string())).into();
        assert_eq!(api.status_code(), 500);
        assert!(!api.message().contains("secrets"));
    }
}
