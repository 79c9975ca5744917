/// Authentication extractors
use crate::{
    api::middleware::extract_bearer_token,
    context::AppContext,
    error::AuthError,
    token::{AccessClaims, TokenScope},
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

fn bearer_claims(parts: &Parts, state: &AppContext) -> Result<AccessClaims, AuthError> {
    let token = extract_bearer_token(&parts.headers).ok_or(AuthError::InvalidToken)?;
    state.auth.verify_access(&token)
}

/// Authenticated caller with a full-scope access token.
///
/// Access tokens are stateless; the claims are trusted until `exp`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account_id: String,
    pub claims: AccessClaims,
}

impl AuthContext {
    pub fn has_permission(&self, slug: &str) -> bool {
        self.claims.has_permission(slug)
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppContext) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts, state)?;

        if claims.scope != TokenScope::Full {
            return Err(AuthError::PasswordChangeRequired);
        }

        Ok(AuthContext {
            account_id: claims.account_id.clone(),
            claims,
        })
    }
}

/// Caller allowed to change their own password: either scope will do
#[derive(Debug, Clone)]
pub struct PasswordChangeContext {
    pub account_id: String,
    pub scope: TokenScope,
}

#[async_trait]
impl FromRequestParts<AppContext> for PasswordChangeContext {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppContext) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts, state)?;

        Ok(PasswordChangeContext {
            account_id: claims.account_id,
            scope: claims.scope,
        })
    }
}

/// Macro to require a permission slug
/// Usage: require_permission!(auth, "accounts.manage");
#[macro_export]
macro_rules! require_permission {
    ($auth:expr, $permission:expr) => {
        if !$auth.has_permission($permission) {
            tracing::debug!(account_id = %$auth.account_id, permission = $permission, "permission denied");
            return Err($crate::error::AuthError::Forbidden(format!(
                "Requires permission {}",
                $permission
            )));
        }
    };
}
