/// Access and refresh token minting and verification
///
/// Access tokens are stateless: verifying one needs only the signature and
/// `exp`. Refresh tokens are signed with a separate secret and carry just the
/// account id and a token id (`jti`); whether they are still usable is decided
/// by the session ledger, not by the signature.
use crate::{
    config::AuthConfig,
    db::account::Account,
    error::{AuthError, AuthResult},
    rbac::ResolvedAccess,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an access token may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// Normal access
    Full,
    /// Only good for setting a new password
    PasswordChange,
}

/// Access token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub account_id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub scope: TokenScope,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    pub fn has_permission(&self, slug: &str) -> bool {
        self.permissions.iter().any(|p| p == slug)
    }
}

/// Refresh token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Token envelope returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// A freshly minted pair plus what the ledger needs to record it
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub pair: TokenPair,
    pub refresh_id: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Signs and verifies access and refresh tokens
#[derive(Clone)]
pub struct TokenIssuer {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    leeway: u64,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> AuthResult<Self> {
        if config.access_token_secret.is_empty() || config.refresh_token_secret.is_empty() {
            return Err(AuthError::Configuration(
                "Access and refresh signing secrets are required".to_string(),
            ));
        }

        Ok(Self {
            access_encoding: EncodingKey::from_secret(config.access_token_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_token_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_token_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_token_secret.as_bytes()),
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
            leeway: config.token_leeway.num_seconds().max(0) as u64,
        })
    }

    /// Fresh opaque id for a refresh token
    pub fn new_token_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Mint an access + refresh pair for an account
    pub fn issue(&self, account: &Account, access: &ResolvedAccess) -> AuthResult<IssuedTokens> {
        self.issue_at(account, access, Self::new_token_id(), Utc::now())
    }

    /// Mint a pair with a caller-chosen refresh id at a given instant
    pub fn issue_at(
        &self,
        account: &Account,
        access: &ResolvedAccess,
        refresh_id: String,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedTokens> {
        let access_claims = AccessClaims {
            account_id: account.id.clone(),
            username: account.username.clone(),
            email: account.email.clone(),
            roles: access.roles.clone(),
            permissions: access.permissions.iter().cloned().collect(),
            scope: TokenScope::Full,
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };
        let access_token = self.encode_access(&access_claims)?;

        let refresh_expires_at = now + self.refresh_ttl;
        let refresh_claims = RefreshClaims {
            sub: account.id.clone(),
            jti: refresh_id.clone(),
            iat: now.timestamp(),
            exp: refresh_expires_at.timestamp(),
        };
        let refresh_token = encode(&Header::new(Algorithm::HS256), &refresh_claims, &self.refresh_encoding)
            .map_err(|e| AuthError::Jwt(format!("Failed to generate refresh token: {}", e)))?;

        Ok(IssuedTokens {
            pair: TokenPair {
                access_token,
                refresh_token,
            },
            refresh_id,
            refresh_expires_at,
        })
    }

    /// Access token that only permits a password change. No roles, no
    /// permissions, no refresh token.
    pub fn issue_restricted(&self, account: &Account) -> AuthResult<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            account_id: account.id.clone(),
            username: account.username.clone(),
            email: account.email.clone(),
            roles: Vec::new(),
            permissions: Vec::new(),
            scope: TokenScope::PasswordChange,
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };
        self.encode_access(&claims)
    }

    fn encode_access(&self, claims: &AccessClaims) -> AuthResult<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.access_encoding)
            .map_err(|e| AuthError::Jwt(format!("Failed to generate access token: {}", e)))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway;
        validation
    }

    /// Verify an access token's signature and expiry
    pub fn verify_access(&self, token: &str) -> AuthResult<AccessClaims> {
        decode::<AccessClaims>(token, &self.access_decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    tracing::debug!(error = %e, "access token rejected");
                    AuthError::InvalidToken
                }
            })
    }

    /// Verify a refresh token's signature and expiry. Every failure folds into
    /// `RefreshInvalid`.
    pub fn verify_refresh(&self, token: &str) -> AuthResult<RefreshClaims> {
        decode::<RefreshClaims>(token, &self.refresh_decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "refresh token rejected");
                AuthError::RefreshInvalid
            })
    }
}
