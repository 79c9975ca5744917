/// Authentication service
///
/// Orchestrates the lockout manager, permission resolver, token issuer,
/// session ledger and password manager. Every public operation is bounded by
/// the configured request timeout; when it fires the in-flight future is
/// dropped, which rolls back any open transaction.

use crate::{
    account::{
        lockout::{LockoutManager, LoginOutcome},
        password::PasswordManager,
        store::{self, AccountStore},
        hasher::PasswordHasher,
        LoginResponse, RegisterRequest, RequestContext, ResetRequestReceipt,
    },
    config::ServerConfig,
    db::account::{Account, AccountStatus, SessionRecord},
    error::{AuthError, AuthResult},
    mailer::ResetNotifier,
    metrics,
    rbac::{self, PermissionResolver},
    session::{self, RevokeReason},
    token::{AccessClaims, TokenIssuer, TokenPair},
};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    db: SqlitePool,
    accounts: AccountStore,
    lockout: LockoutManager,
    passwords: PasswordManager,
    resolver: PermissionResolver,
    tokens: TokenIssuer,
    request_timeout: Duration,
}

impl AuthService {
    /// Create a new auth service
    pub fn new(
        db: SqlitePool,
        config: &ServerConfig,
        notifier: Arc<dyn ResetNotifier>,
    ) -> AuthResult<Self> {
        let hasher = PasswordHasher::new(&config.password)?;

        Ok(Self {
            accounts: AccountStore::new(db.clone(), hasher.clone(), config.password.clone()),
            lockout: LockoutManager::new(db.clone(), hasher.clone(), config.lockout.clone()),
            passwords: PasswordManager::new(db.clone(), hasher, config.password.clone(), notifier),
            resolver: PermissionResolver::new(db.clone()),
            tokens: TokenIssuer::new(&config.authentication)?,
            request_timeout: config.service.request_timeout,
            db,
        })
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Run `fut` under the request timeout
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> AuthResult<T>
    where
        F: Future<Output = AuthResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.request_timeout.as_millis() as u64, "operation timed out");
                metrics::record_timeout(operation);
                Err(AuthError::Timeout)
            }
        }
    }

    /// Self-registration. New accounts wait in PENDING until an
    /// administrator activates them.
    pub async fn register(&self, req: &RegisterRequest, ctx: &RequestContext) -> AuthResult<Account> {
        self.bounded(
            "register",
            self.accounts.create_account(
                &req.username,
                &req.email,
                &req.password,
                AccountStatus::Pending,
                ctx,
            ),
        )
        .await
    }

    /// Log in with username or email
    pub async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<LoginResponse> {
        self.bounded("authenticate", async {
            match self.lockout.attempt(identifier, password, ctx).await? {
                LoginOutcome::Success(account) => {
                    if account.must_change_password {
                        metrics::record_login("password_change_required");
                        let access_token = self.tokens.issue_restricted(&account)?;
                        return Ok(LoginResponse {
                            access_token,
                            refresh_token: None,
                            password_change_required: true,
                        });
                    }

                    let pair = self.start_session(&account, ctx).await?;
                    metrics::record_login("success");
                    Ok(LoginResponse {
                        access_token: pair.access_token,
                        refresh_token: Some(pair.refresh_token),
                        password_change_required: false,
                    })
                }
                LoginOutcome::InvalidCredentials { .. } => {
                    metrics::record_login("invalid_credentials");
                    Err(AuthError::InvalidCredentials)
                }
                LoginOutcome::AccountLocked { remaining } => {
                    metrics::record_login("locked");
                    Err(AuthError::AccountLocked { remaining })
                }
                LoginOutcome::AccountNotActive { status } => {
                    metrics::record_login("not_active");
                    Err(AuthError::AccountNotActive { status })
                }
            }
        })
        .await
    }

    /// Resolve permissions, mint a pair and persist the session row. The
    /// insert is the only write, so no transaction is needed.
    async fn start_session(&self, account: &Account, ctx: &RequestContext) -> AuthResult<TokenPair> {
        let mut conn = self.db.acquire().await?;

        let access = rbac::resolve_access(&mut conn, &account.id).await?;
        let issued = self.tokens.issue(account, &access)?;
        session::record(&mut conn, &account.id, &issued.refresh_id, issued.refresh_expires_at, ctx).await?;

        Ok(issued.pair)
    }

    /// Rotate a refresh token. The presented token is single use.
    pub async fn refresh(&self, refresh_token: &str, ctx: &RequestContext) -> AuthResult<TokenPair> {
        self.bounded("refresh", async {
            let result = self.rotate(refresh_token, ctx).await;
            metrics::record_refresh(result.is_ok());
            result
        })
        .await
    }

    async fn rotate(&self, refresh_token: &str, ctx: &RequestContext) -> AuthResult<TokenPair> {
        let claims = self.tokens.verify_refresh(refresh_token)?;
        let successor = TokenIssuer::new_token_id();

        let mut tx = self.db.begin().await?;

        let consumed = match session::consume(&mut tx, &claims.jti, &successor).await {
            Ok(record) => record,
            Err(AuthError::ReuseDetected { account_id }) => {
                session::revoke_all(&mut tx, &account_id, RevokeReason::ReuseDetected).await?;
                tx.commit().await?;

                tracing::warn!(
                    account_id = %account_id,
                    token_id = %claims.jti,
                    ip = ?ctx.ip,
                    "refresh token reuse detected, all sessions revoked"
                );
                metrics::record_refresh_reuse();
                return Err(AuthError::RefreshInvalid);
            }
            Err(e) => return Err(e),
        };

        let account = if consumed.account_id == claims.sub {
            store::find_live_by_id(&mut tx, &consumed.account_id)
                .await?
                .filter(|account| account.status == AccountStatus::Active && !account.must_change_password)
        } else {
            None
        };

        // The consumed row stays revoked even when nothing is minted
        let Some(account) = account else {
            tx.commit().await?;
            tracing::debug!(account_id = %consumed.account_id, "refresh refused for ineligible account");
            return Err(AuthError::RefreshInvalid);
        };

        let access = rbac::resolve_access(&mut tx, &account.id).await?;
        let issued = self.tokens.issue_at(&account, &access, successor, chrono::Utc::now())?;
        session::record(&mut tx, &account.id, &issued.refresh_id, issued.refresh_expires_at, ctx).await?;

        tx.commit().await?;

        tracing::debug!(account_id = %account.id, "refresh token rotated");
        Ok(issued.pair)
    }

    /// Revoke the session behind a refresh token. Repeating it is harmless.
    pub async fn logout(&self, refresh_token: &str, ctx: &RequestContext) -> AuthResult<()> {
        self.bounded("logout", async {
            let claims = self.tokens.verify_refresh(refresh_token)?;

            let mut conn = self.db.acquire().await?;
            if session::revoke(&mut conn, &claims.jti, RevokeReason::Logout).await? {
                tracing::info!(account_id = %claims.sub, ip = ?ctx.ip, "logged out");
            }
            Ok(())
        })
        .await
    }

    /// Revoke every session of an account
    pub async fn logout_all(&self, account_id: &str, ctx: &RequestContext) -> AuthResult<u64> {
        self.bounded("logout_all", async {
            let mut conn = self.db.acquire().await?;
            let revoked = session::revoke_all(&mut conn, account_id, RevokeReason::LogoutAll).await?;
            tracing::info!(account_id, revoked, actor = ?ctx.actor_id, "all sessions revoked");
            Ok(revoked)
        })
        .await
    }

    /// Live sessions of an account, newest first
    pub async fn sessions(&self, account_id: &str) -> AuthResult<Vec<SessionRecord>> {
        self.bounded("sessions", async {
            let mut conn = self.db.acquire().await?;
            session::active_sessions(&mut conn, account_id).await
        })
        .await
    }

    /// Whether a refresh token id can no longer mint tokens
    pub async fn is_revoked(&self, token_id: &str) -> AuthResult<bool> {
        self.bounded("is_revoked", async {
            let mut conn = self.db.acquire().await?;
            session::is_revoked(&mut conn, token_id).await
        })
        .await
    }

    pub async fn change_password(
        &self,
        account_id: &str,
        current: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        self.bounded(
            "change_password",
            self.passwords.change_password(account_id, current, new_password, ctx),
        )
        .await?;
        metrics::record_password_change("change");
        Ok(())
    }

    /// Administrative reset; forces a change at next login
    pub async fn reset_password(
        &self,
        account_id: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        self.bounded(
            "reset_password",
            self.passwords.reset_password(account_id, new_password, ctx),
        )
        .await?;
        metrics::record_password_change("admin_reset");
        Ok(())
    }

    pub async fn reset_password_request(&self, email: &str) -> AuthResult<ResetRequestReceipt> {
        self.bounded("reset_password_request", self.passwords.request_reset(email))
            .await
    }

    pub async fn reset_password_confirm(
        &self,
        raw_token: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        self.bounded(
            "reset_password_confirm",
            self.passwords.confirm_reset(raw_token, new_password, ctx),
        )
        .await?;
        metrics::record_password_change("self_reset");
        Ok(())
    }

    /// Current effective permissions of an account
    pub async fn resolve_permissions(&self, account_id: &str) -> AuthResult<BTreeSet<String>> {
        self.bounded("resolve_permissions", self.resolver.resolve(account_id))
            .await
    }

    /// Verify a bearer access token
    pub fn verify_access(&self, token: &str) -> AuthResult<AccessClaims> {
        self.tokens.verify_access(token)
    }
}
