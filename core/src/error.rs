//! Error types for the security pipeline and its components

use chrono::{DateTime, Utc};
use http::{HeaderValue, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::SecureResponse;
use crate::sanitizer::ThreatKind;

/// Terminal outcomes of a guarded request.
///
/// The `Display` text is for server-side logs only; clients receive the
/// deliberately generic bodies produced by [`GuardError::to_response`].
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("rate limit exceeded ({limit} requests per window)")]
    RateLimitExceeded {
        limit: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: i64,
    },

    #[error("CSRF validation failed: {0}")]
    CsrfValidationFailed(String),

    #[error("request origin not allowed: {0}")]
    OriginMismatch(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("account {user_id} is locked or inactive")]
    AccountLocked { user_id: String },

    #[error("user {user_id} with role {role} lacks the required role")]
    InsufficientPermissions { user_id: String, role: String },

    #[error("second factor token missing for user {user_id}")]
    TwoFactorRequired { user_id: String },

    #[error("validation failed: {message}")]
    ValidationFailed {
        message: String,
        details: Option<Value>,
    },

    #[error("malicious input detected in field {field}")]
    MaliciousInputDetected {
        field: String,
        threats: Vec<ThreatKind>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GuardError {
    pub fn status(&self) -> StatusCode {
        match self {
            GuardError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GuardError::CsrfValidationFailed(_)
            | GuardError::OriginMismatch(_)
            | GuardError::InsufficientPermissions { .. }
            | GuardError::TwoFactorRequired { .. } => StatusCode::FORBIDDEN,
            GuardError::AuthenticationRequired | GuardError::AccountLocked { .. } => {
                StatusCode::UNAUTHORIZED
            }
            GuardError::ValidationFailed { .. } | GuardError::MaliciousInputDetected { .. } => {
                StatusCode::BAD_REQUEST
            }
            GuardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this outcome must be persisted as a security event.
    pub fn is_security_relevant(&self) -> bool {
        !matches!(
            self,
            GuardError::ValidationFailed { .. } | GuardError::Internal(_)
        )
    }

    /// Only rate limiting is worth retrying.
    pub fn retry_after(&self) -> Option<i64> {
        match self {
            GuardError::RateLimitExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    pub fn to_response(&self) -> SecureResponse {
        let status = self.status();
        match self {
            GuardError::RateLimitExceeded {
                limit,
                reset_at,
                retry_after_secs,
            } => {
                let mut response = SecureResponse::json(
                    status,
                    json!({
                        "error": "Too many requests",
                        "message": "Rate limit exceeded, please try again later",
                        "retryAfter": retry_after_secs,
                    }),
                );
                response.set_rate_limit_headers(*limit, 0, *reset_at);
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers.insert(http::header::RETRY_AFTER, value);
                }
                response
            }
            GuardError::CsrfValidationFailed(_)
            | GuardError::OriginMismatch(_)
            | GuardError::InsufficientPermissions { .. }
            | GuardError::TwoFactorRequired { .. } => {
                SecureResponse::json(status, json!({ "error": "Forbidden" }))
            }
            GuardError::AuthenticationRequired | GuardError::AccountLocked { .. } => {
                SecureResponse::json(status, json!({ "error": "Authentication required" }))
            }
            GuardError::ValidationFailed { message, details } => {
                let mut body = json!({ "error": message });
                if let Some(details) = details {
                    body["details"] = details.clone();
                }
                SecureResponse::json(status, body)
            }
            GuardError::MaliciousInputDetected { field, .. } => SecureResponse::json(
                status,
                json!({ "error": "Invalid input", "details": { "field": field } }),
            ),
            GuardError::Internal(_) => {
                SecureResponse::json(status, json!({ "error": "Internal server error" }))
            }
        }
    }
}

/// Failures of the key-value and persistent stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("stored value is malformed: {0}")]
    Corrupt(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("no security profile for user {0}")]
    UnknownUser(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum TwoFactorError {
    #[error("no security profile for user {0}")]
    UnknownUser(String),

    #[error("two-factor authentication has not been set up")]
    NotSetUp,

    #[error("two-factor authentication is already enabled")]
    AlreadyEnabled,

    #[error("stored two-factor secret is malformed")]
    InvalidSecret,

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(Uuid),

    #[error("alert {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GuardError::AuthenticationRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GuardError::CsrfValidationFailed("missing token".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GuardError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_forbidden_body_is_generic() {
        let response = GuardError::OriginMismatch("https://evil.example".into()).to_response();
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.body, json!({ "error": "Forbidden" }));
        assert!(!response.body.to_string().contains("evil"));
    }

    #[test]
    fn test_internal_error_hides_details() {
        let response = GuardError::Internal("db password=hunter2".into()).to_response();
        assert_eq!(response.body, json!({ "error": "Internal server error" }));
    }

    #[test]
    fn test_rate_limit_response_headers() {
        let reset_at = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        let err = GuardError::RateLimitExceeded {
            limit: 5,
            reset_at,
            retry_after_secs: 42,
        };
        let response = err.to_response();

        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.body["retryAfter"], 42);
        assert_eq!(response.headers["retry-after"], "42");
        assert_eq!(response.headers["x-ratelimit-limit"], "5");
        assert_eq!(response.headers["x-ratelimit-remaining"], "0");
        assert_eq!(err.retry_after(), Some(42));
    }

    #[test]
    fn test_security_relevance() {
        assert!(GuardError::TwoFactorRequired { user_id: "u1".into() }.is_security_relevant());
        assert!(!GuardError::ValidationFailed {
            message: "bad".into(),
            details: None
        }
        .is_security_relevant());
        assert!(GuardError::Internal("x".into()).retry_after().is_none());
    }
}
