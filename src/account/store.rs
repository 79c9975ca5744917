/// Credential store
///
/// Lookup helpers used by the login and password flows, plus the
/// administrative lifecycle mutations on accounts.
use crate::{
    account::{hasher::PasswordHasher, password, RequestContext},
    config::PasswordConfig,
    db::account::{Account, AccountStatus, ACCOUNT_COLUMNS},
    error::{AuthError, AuthResult},
    session::{self, RevokeReason},
};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Usernames and emails are compared trimmed and lowercased
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Find a non-deleted account by username or email.
///
/// Soft-deleted rows are excluded here, so they never authenticate
/// whatever their status.
pub async fn find_by_identifier(
    conn: &mut SqliteConnection,
    identifier: &str,
) -> AuthResult<Option<Account>> {
    let identifier = normalize_identifier(identifier);

    let account = sqlx::query_as::<_, Account>(&format!(
        "SELECT {} FROM account
         WHERE (username = ?1 OR email = ?1) AND deleted_at IS NULL",
        ACCOUNT_COLUMNS
    ))
    .bind(&identifier)
    .fetch_optional(conn)
    .await?;

    Ok(account)
}

/// Find a non-deleted account by email only
pub async fn find_by_email(conn: &mut SqliteConnection, email: &str) -> AuthResult<Option<Account>> {
    let account = sqlx::query_as::<_, Account>(&format!(
        "SELECT {} FROM account WHERE email = ?1 AND deleted_at IS NULL",
        ACCOUNT_COLUMNS
    ))
    .bind(normalize_identifier(email))
    .fetch_optional(conn)
    .await?;

    Ok(account)
}

/// Find a non-deleted account by id
pub async fn find_live_by_id(conn: &mut SqliteConnection, id: &str) -> AuthResult<Option<Account>> {
    let account = sqlx::query_as::<_, Account>(&format!(
        "SELECT {} FROM account WHERE id = ?1 AND deleted_at IS NULL",
        ACCOUNT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(account)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

/// Account lifecycle administration
#[derive(Clone)]
pub struct AccountStore {
    db: SqlitePool,
    hasher: PasswordHasher,
    password: PasswordConfig,
}

impl AccountStore {
    pub fn new(db: SqlitePool, hasher: PasswordHasher, password: PasswordConfig) -> Self {
        Self { db, hasher, password }
    }

    /// Create an account. Username and email are normalized before the
    /// uniqueness check.
    pub async fn create_account(
        &self,
        username: &str,
        email: &str,
        plaintext: &str,
        status: AccountStatus,
        ctx: &RequestContext,
    ) -> AuthResult<Account> {
        let username = normalize_identifier(username);
        let email = normalize_identifier(email);

        if username.is_empty() || email.is_empty() {
            return Err(AuthError::Validation("Username and email are required".to_string()));
        }
        if username.contains('@') {
            return Err(AuthError::Validation("Username must not contain '@'".to_string()));
        }

        password::validate_policy(&self.password, plaintext)?;

        // Hash before touching the database so no connection waits on Argon2
        let password_hash = self.hasher.hash(plaintext).await?;

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let result = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO account (id, username, email, password_hash, status, failed_attempts,
                 password_changed_at, must_change_password, created_at, updated_at, created_by, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 0, ?6, ?6, ?7, ?7)
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(&id)
        .bind(&username)
        .bind(&email)
        .bind(&password_hash)
        .bind(status.as_str())
        .bind(now)
        .bind(&ctx.actor_id)
        .fetch_one(&self.db)
        .await;

        match result {
            Ok(account) => {
                tracing::info!(account_id = %account.id, username = %account.username, "account created");
                Ok(account)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(AuthError::Conflict("Username or email already registered".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load a non-deleted account
    pub async fn get_account(&self, id: &str) -> AuthResult<Account> {
        let mut conn = self.db.acquire().await?;
        find_live_by_id(&mut conn, id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("Account {} not found", id)))
    }

    /// Change status. Anything other than ACTIVE also revokes every session.
    pub async fn set_status(
        &self,
        id: &str,
        status: AccountStatus,
        ctx: &RequestContext,
    ) -> AuthResult<Account> {
        let mut tx = self.db.begin().await?;

        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE account SET status = ?1, updated_at = ?2, updated_by = ?3
             WHERE id = ?4 AND deleted_at IS NULL
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(&ctx.actor_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AuthError::NotFound(format!("Account {} not found", id)))?;

        if status != AccountStatus::Active {
            session::revoke_all(&mut tx, id, RevokeReason::StatusChange).await?;
        }

        tx.commit().await?;

        tracing::info!(account_id = id, status = %status, actor = ?ctx.actor_id, "account status changed");
        Ok(account)
    }

    /// Soft delete. The row stays; it can never authenticate again.
    pub async fn soft_delete(&self, id: &str, ctx: &RequestContext) -> AuthResult<()> {
        let mut tx = self.db.begin().await?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE account SET deleted_at = ?1, updated_at = ?1, updated_by = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(&ctx.actor_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(format!("Account {} not found", id)));
        }

        session::revoke_all(&mut tx, id, RevokeReason::StatusChange).await?;
        tx.commit().await?;

        tracing::info!(account_id = id, actor = ?ctx.actor_id, "account soft-deleted");
        Ok(())
    }

    /// Clear the failure counter and any lock
    pub async fn unlock(&self, id: &str, ctx: &RequestContext) -> AuthResult<Account> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE account SET failed_attempts = 0, lock_expiry = NULL, updated_at = ?1, updated_by = ?2
             WHERE id = ?3 AND deleted_at IS NULL
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(Utc::now())
        .bind(&ctx.actor_id)
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AuthError::NotFound(format!("Account {} not found", id)))?;

        tracing::info!(account_id = id, actor = ?ctx.actor_id, "account unlocked");
        Ok(account)
    }
}
