/// Login audit log
///
/// Append-only: one row per attempt, never updated. The submitted identifier
/// is stored, the password never is.
use crate::{
    account::RequestContext,
    db::account::LoginAttempt,
    error::AuthResult,
};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnknownIdentifier,
    BadPassword,
    Locked,
    NotActive,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownIdentifier => "unknown_identifier",
            FailureReason::BadPassword => "bad_password",
            FailureReason::Locked => "locked",
            FailureReason::NotActive => "not_active",
        }
    }
}

/// Write one attempt row
pub async fn record_attempt(
    conn: &mut SqliteConnection,
    credential: &str,
    account_id: Option<&str>,
    failure: Option<FailureReason>,
    ctx: &RequestContext,
) -> AuthResult<()> {
    sqlx::query(
        "INSERT INTO login_attempt (credential, ip, user_agent, attempted_at, success, failure_reason, account_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(credential)
    .bind(&ctx.ip)
    .bind(&ctx.user_agent)
    .bind(Utc::now())
    .bind(failure.is_none())
    .bind(failure.map(|f| f.as_str()))
    .bind(account_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Most recent attempts for an account, newest first
pub async fn recent_attempts(
    db: &SqlitePool,
    account_id: &str,
    limit: u32,
) -> AuthResult<Vec<LoginAttempt>> {
    let rows = sqlx::query_as::<_, LoginAttempt>(
        "SELECT id, credential, ip, user_agent, attempted_at, success, failure_reason, account_id
         FROM login_attempt
         WHERE account_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )
    .bind(account_id)
    .bind(limit as i64)
    .fetch_all(db)
    .await?;

    Ok(rows)
}
