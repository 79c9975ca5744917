/// Password lifecycle
///
/// Change, administrative reset and self-service reset. Every path ends in
/// `apply_new_password`, which writes the new hash, rotates history and
/// revokes all sessions in one transaction.
use crate::{
    account::{hasher::PasswordHasher, store, RequestContext, ResetRequestReceipt},
    config::PasswordConfig,
    db::account::Account,
    error::{AuthError, AuthResult, PolicyViolation},
    mailer::ResetNotifier,
    session::{self, RevokeReason},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

/// Check the length rule. Counted in characters, not bytes.
pub fn validate_policy(config: &PasswordConfig, candidate: &str) -> AuthResult<()> {
    if candidate.chars().count() < config.min_length {
        return Err(AuthError::PasswordPolicyViolation(PolicyViolation::TooShort {
            min: config.min_length,
        }));
    }
    Ok(())
}

/// SHA-256 hex digest of a raw reset token
pub fn digest_reset_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// How a password write should treat the rest of the account
struct PasswordUpdate {
    must_change: bool,
    clear_lockout: bool,
    reason: RevokeReason,
}

/// Store a new hash for `account`.
///
/// Guarded on the hash the caller checked against; a concurrent change in
/// between surfaces as `Conflict` and nothing is written.
async fn apply_new_password(
    conn: &mut SqliteConnection,
    account: &Account,
    new_hash: &str,
    history_size: u32,
    update: PasswordUpdate,
    ctx: &RequestContext,
) -> AuthResult<()> {
    let now = Utc::now();

    let lockout_clause = if update.clear_lockout {
        ", failed_attempts = 0, lock_expiry = NULL"
    } else {
        ""
    };

    let result = sqlx::query(&format!(
        "UPDATE account
         SET password_hash = ?1, password_changed_at = ?2, must_change_password = ?3,
             updated_at = ?2, updated_by = ?4{}
         WHERE id = ?5 AND password_hash = ?6 AND deleted_at IS NULL",
        lockout_clause
    ))
    .bind(new_hash)
    .bind(now)
    .bind(update.must_change)
    .bind(&ctx.actor_id)
    .bind(&account.id)
    .bind(&account.password_hash)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AuthError::Conflict(
            "Password was changed concurrently; retry".to_string(),
        ));
    }

    sqlx::query("INSERT INTO password_history (account_id, password_hash, created_at) VALUES (?1, ?2, ?3)")
        .bind(&account.id)
        .bind(&account.password_hash)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    // Keep only the newest `history_size` entries
    sqlx::query(
        "DELETE FROM password_history
         WHERE account_id = ?1 AND id NOT IN (
             SELECT id FROM password_history WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2
         )",
    )
    .bind(&account.id)
    .bind(history_size as i64)
    .execute(&mut *conn)
    .await?;

    session::revoke_all(conn, &account.id, update.reason).await?;

    Ok(())
}

/// Password lifecycle manager
#[derive(Clone)]
pub struct PasswordManager {
    db: SqlitePool,
    hasher: PasswordHasher,
    config: PasswordConfig,
    notifier: Arc<dyn ResetNotifier>,
}

impl PasswordManager {
    pub fn new(
        db: SqlitePool,
        hasher: PasswordHasher,
        config: PasswordConfig,
        notifier: Arc<dyn ResetNotifier>,
    ) -> Self {
        Self {
            db,
            hasher,
            config,
            notifier,
        }
    }

    async fn load(&self, account_id: &str) -> AuthResult<Account> {
        let mut conn = self.db.acquire().await?;
        store::find_live_by_id(&mut conn, account_id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("Account {} not found", account_id)))
    }

    async fn history(&self, account_id: &str) -> AuthResult<Vec<String>> {
        let hashes = sqlx::query_scalar(
            "SELECT password_hash FROM password_history
             WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(account_id)
        .bind(self.config.history_size as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(hashes)
    }

    /// Reject a candidate that matches the current hash or retained history
    async fn ensure_not_reused(&self, account: &Account, candidate: &str) -> AuthResult<()> {
        let mut hashes = self.history(&account.id).await?;
        hashes.push(account.password_hash.clone());

        if self.hasher.matches_any(candidate, hashes).await? {
            return Err(AuthError::PasswordPolicyViolation(PolicyViolation::Reused));
        }
        Ok(())
    }

    async fn commit_new_password(
        &self,
        account: &Account,
        new_password: &str,
        update: PasswordUpdate,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        let new_hash = self.hasher.hash(new_password).await?;

        let mut tx = self.db.begin().await?;
        apply_new_password(&mut tx, account, &new_hash, self.config.history_size, update, ctx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Self-service change. The current password must be supplied.
    pub async fn change_password(
        &self,
        account_id: &str,
        current: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        let account = self.load(account_id).await?;

        if !self.hasher.verify(current, &account.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }

        if new_password == current {
            return Err(AuthError::PasswordPolicyViolation(PolicyViolation::SameAsCurrent));
        }

        validate_policy(&self.config, new_password)?;
        self.ensure_not_reused(&account, new_password).await?;

        self.commit_new_password(
            &account,
            new_password,
            PasswordUpdate {
                must_change: false,
                clear_lockout: false,
                reason: RevokeReason::PasswordChange,
            },
            ctx,
        )
        .await?;

        tracing::info!(account_id, "password changed");
        Ok(())
    }

    /// Administrative reset. The holder must change it at next login.
    pub async fn reset_password(
        &self,
        account_id: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        let account = self.load(account_id).await?;

        validate_policy(&self.config, new_password)?;
        self.ensure_not_reused(&account, new_password).await?;

        self.commit_new_password(
            &account,
            new_password,
            PasswordUpdate {
                must_change: true,
                clear_lockout: false,
                reason: RevokeReason::PasswordReset,
            },
            ctx,
        )
        .await?;

        tracing::info!(account_id, actor = ?ctx.actor_id, "password reset by administrator");
        Ok(())
    }

    /// Start a self-service reset. The receipt looks the same whether or not
    /// the email belongs to anyone.
    pub async fn request_reset(&self, email: &str) -> AuthResult<ResetRequestReceipt> {
        let receipt = ResetRequestReceipt {
            request_id: Uuid::new_v4().to_string(),
            expires_in_seconds: self.config.reset_token_ttl.num_seconds(),
        };

        let account = {
            let mut conn = self.db.acquire().await?;
            store::find_by_email(&mut conn, email).await?
        };

        let Some(account) = account else {
            tracing::debug!(request_id = %receipt.request_id, "reset requested for unknown email");
            return Ok(receipt);
        };

        let raw_token = generate_reset_token();
        let now = Utc::now();
        let expires_at = now + self.config.reset_token_ttl;

        sqlx::query(
            "INSERT INTO password_reset_token (token_hash, account_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(digest_reset_token(&raw_token))
        .bind(&account.id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.db)
        .await?;

        tracing::info!(account_id = %account.id, request_id = %receipt.request_id, "password reset requested");

        // Delivery outcome never reaches the caller
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier
                .send_password_reset(&account, &raw_token, expires_at)
                .await
            {
                tracing::error!(account_id = %account.id, error = %e, "failed to deliver reset token");
            }
        });

        Ok(receipt)
    }

    /// Finish a self-service reset with the raw token from the email
    pub async fn confirm_reset(
        &self,
        raw_token: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        validate_policy(&self.config, new_password)?;

        let token_hash = digest_reset_token(raw_token);
        let now = Utc::now();

        let account_id: Option<String> = sqlx::query_scalar(
            "SELECT account_id FROM password_reset_token
             WHERE token_hash = ?1 AND used_at IS NULL AND expires_at > ?2",
        )
        .bind(&token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        let account_id = account_id.ok_or(AuthError::InvalidToken)?;
        let account = self.load(&account_id).await?;
        self.ensure_not_reused(&account, new_password).await?;

        let new_hash = self.hasher.hash(new_password).await?;

        let mut tx = self.db.begin().await?;

        // Claiming the token is the first write, so two confirmations of the
        // same token cannot both succeed
        let claimed = sqlx::query(
            "UPDATE password_reset_token SET used_at = ?1
             WHERE token_hash = ?2 AND used_at IS NULL AND expires_at > ?1",
        )
        .bind(Utc::now())
        .bind(&token_hash)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            return Err(AuthError::InvalidToken);
        }

        // Any other outstanding tokens for this account die with this one
        sqlx::query(
            "UPDATE password_reset_token SET used_at = ?1
             WHERE account_id = ?2 AND used_at IS NULL",
        )
        .bind(Utc::now())
        .bind(&account.id)
        .execute(&mut *tx)
        .await?;

        let ctx = ctx.clone().with_actor(account.id.clone());
        apply_new_password(
            &mut tx,
            &account,
            &new_hash,
            self.config.history_size,
            PasswordUpdate {
                must_change: false,
                clear_lockout: true,
                reason: RevokeReason::PasswordReset,
            },
            &ctx,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(account_id = %account.id, "password reset completed");
        Ok(())
    }
}
