/// Unified error types for the Vigil auth core
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::db::account::AccountStatus;

/// Which password rule a candidate password broke
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum PolicyViolation {
    /// Shorter than the configured minimum
    TooShort { min: usize },
    /// Identical to the current password
    SameAsCurrent,
    /// Matches the current hash or one of the retained previous hashes
    Reused,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::TooShort { min } => {
                write!(f, "password must be at least {} characters", min)
            }
            PolicyViolation::SameAsCurrent => {
                write!(f, "new password must differ from the current password")
            }
            PolicyViolation::Reused => write!(f, "password was used recently"),
        }
    }
}

/// Main error type for the auth core
#[derive(Error, Debug)]
pub enum AuthError {
    /// Wrong identifier or password. Never says which.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Account is temporarily locked after repeated failures
    #[error("Account locked for another {} seconds", remaining.num_seconds())]
    AccountLocked { remaining: chrono::Duration },

    /// Account exists but is not in the ACTIVE state
    #[error("Account is not active: {status}")]
    AccountNotActive { status: AccountStatus },

    /// Refresh token expired, revoked or unknown
    #[error("Refresh token is invalid")]
    RefreshInvalid,

    /// An already rotated refresh token was presented again
    #[error("Refresh token reuse detected for account {account_id}")]
    ReuseDetected { account_id: String },

    /// Password rejected by policy
    #[error("Password policy violation: {0}")]
    PasswordPolicyViolation(PolicyViolation),

    /// Missing or malformed configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Access token signature valid but expired
    #[error("Token has expired")]
    TokenExpired,

    /// Access token malformed or signed with the wrong key
    #[error("Invalid token")]
    InvalidToken,

    /// Restricted token presented to a route that needs a full token
    #[error("Password change required")]
    PasswordChangeRequired,

    /// Authenticated but lacking a permission
    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g., duplicate username)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation exceeded the configured request timeout and was rolled back
    #[error("Operation timed out")]
    Timeout,

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JWT encoding errors
    #[error("JWT error: {0}")]
    Jwt(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable error code exposed to clients.
    ///
    /// Reuse detection is reported as a plain invalid refresh token.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "InvalidCredentials",
            AuthError::AccountLocked { .. } => "AccountLocked",
            AuthError::AccountNotActive { .. } => "AccountNotActive",
            AuthError::RefreshInvalid | AuthError::ReuseDetected { .. } => "RefreshInvalid",
            AuthError::PasswordPolicyViolation(_) => "PasswordPolicyViolation",
            AuthError::TokenExpired => "TokenExpired",
            AuthError::InvalidToken => "InvalidToken",
            AuthError::PasswordChangeRequired => "PasswordChangeRequired",
            AuthError::Forbidden(_) => "Forbidden",
            AuthError::NotFound(_) => "NotFound",
            AuthError::Conflict(_) => "Conflict",
            AuthError::Validation(_) => "InvalidRequest",
            AuthError::Configuration(_)
            | AuthError::Timeout
            | AuthError::Database(_)
            | AuthError::Jwt(_)
            | AuthError::Internal(_) => "InternalServerError",
        }
    }

    /// True for failures the caller cannot act on (storage, config, bugs)
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            AuthError::Configuration(_)
                | AuthError::Timeout
                | AuthError::Database(_)
                | AuthError::Jwt(_)
                | AuthError::Internal(_)
        )
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<PolicyViolation>,
}

/// Convert AuthError to HTTP response
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if self.is_unexpected() {
            tracing::error!(error = %self, "request failed");
        }

        let status = match &self {
            AuthError::InvalidCredentials
            | AuthError::RefreshInvalid
            | AuthError::ReuseDetected { .. }
            | AuthError::TokenExpired
            | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::AccountLocked { .. } => StatusCode::LOCKED,
            AuthError::AccountNotActive { .. }
            | AuthError::PasswordChangeRequired
            | AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::PasswordPolicyViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            AuthError::ReuseDetected { .. } => AuthError::RefreshInvalid.to_string(),
            e if e.is_unexpected() => "Internal server error".to_string(), // Don't leak details
            e => e.to_string(),
        };

        let retry_after_seconds = match &self {
            AuthError::AccountLocked { remaining } => Some(remaining.num_seconds().max(1)),
            _ => None,
        };

        let violation = match &self {
            AuthError::PasswordPolicyViolation(v) => Some(v.clone()),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
            retry_after_seconds,
            violation,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after_seconds {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for auth operations
pub type AuthResult<T> = Result<T, AuthError>;
