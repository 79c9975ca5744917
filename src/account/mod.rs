/// Account management system
///
/// Handles credential verification, lockout, password lifecycle and the
/// orchestration of token issuance for accounts.

pub mod audit;
pub mod hasher;
pub mod lockout;
mod manager;
pub mod password;
pub mod store;

pub use manager::AuthService;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Who is acting and from where.
///
/// Passed explicitly into every mutating operation; nothing in the core reads
/// ambient request state.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Account performing the action (None for anonymous or self-service login)
    pub actor_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Build a context from request headers, preferring the first
    /// `X-Forwarded-For` hop for the client address
    pub fn from_headers(headers: &HeaderMap, actor_id: Option<String>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let ip = header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
            .or_else(|| header("x-real-ip"));

        Self {
            actor_id,
            ip,
            user_agent: header("user-agent"),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 64))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

/// Public view of an account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: String,
    pub username: String,
    pub email: String,
    pub status: crate::db::account::AccountStatus,
    pub must_change_password: bool,
}

impl From<&crate::db::account::Account> for AccountInfo {
    fn from(account: &crate::db::account::Account) -> Self {
        Self {
            id: account.id.clone(),
            username: account.username.clone(),
            email: account.email.clone(),
            status: account.status,
            must_change_password: account.must_change_password,
        }
    }
}

/// Login request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoginRequest {
    /// Username or email
    #[validate(length(min = 1, max = 320))]
    pub identifier: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

/// Login response.
///
/// When the account must change its password only a restricted access token
/// is returned and `refresh_token` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub password_change_required: bool,
}

/// Token refresh / logout request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[validate(length(min = 1, max = 4096))]
    pub refresh_token: String,
}

/// Password change request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, max = 1024))]
    pub current_password: String,
    #[validate(length(min = 1, max = 1024))]
    pub new_password: String,
}

/// Administrative password reset
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AdminResetPasswordRequest {
    #[validate(length(min = 1, max = 1024))]
    pub new_password: String,
}

/// Self-service reset request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PasswordResetRequest {
    #[validate(length(min = 1, max = 320))]
    pub email: String,
}

/// Response to a reset request. Identical whether or not the email exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequestReceipt {
    pub request_id: String,
    pub expires_in_seconds: i64,
}

/// Self-service reset confirmation
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetConfirm {
    #[validate(length(min = 1, max = 256))]
    pub token: String,
    #[validate(length(min = 1, max = 1024))]
    pub new_password: String,
}

/// Status change request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub status: crate::db::account::AccountStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("vigil-test/1.0"));

        let ctx = RequestContext::from_headers(&headers, Some("admin-1".to_string()));
        assert_eq!(ctx.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(ctx.user_agent.as_deref(), Some("vigil-test/1.0"));
        assert_eq!(ctx.actor_id.as_deref(), Some("admin-1"));
    }

    #[test]
    fn test_login_request_validation() {
        let ok = LoginRequest {
            identifier: "bob".to_string(),
            password: "secret".to_string(),
        };
        assert!(ok.validate().is_ok());

        let empty = LoginRequest {
            identifier: String::new(),
            password: "secret".to_string(),
        };
        assert!(empty.validate().is_err());
    }
}
