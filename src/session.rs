/// Session & revocation ledger
///
/// One row per issued refresh token. Rows are only ever mutated to set
/// `revoked_at`; rotation inserts a fresh row and revokes the consumed one.
/// All functions take a connection so callers can compose them into a single
/// transaction with the rest of the operation.
use crate::{
    account::RequestContext,
    db::account::SessionRecord,
    error::{AuthError, AuthResult},
};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

const SESSION_COLUMNS: &str =
    "token_id, account_id, issued_at, expires_at, revoked_at, revoked_reason, replaced_by, ip, user_agent";

/// Why a session row was revoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    Rotated,
    Logout,
    LogoutAll,
    PasswordChange,
    PasswordReset,
    StatusChange,
    ReuseDetected,
}

impl RevokeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::Rotated => "rotated",
            RevokeReason::Logout => "logout",
            RevokeReason::LogoutAll => "logout_all",
            RevokeReason::PasswordChange => "password_change",
            RevokeReason::PasswordReset => "password_reset",
            RevokeReason::StatusChange => "status_change",
            RevokeReason::ReuseDetected => "reuse_detected",
        }
    }
}

/// Persist the record for a refresh token that is about to be handed out
pub async fn record(
    conn: &mut SqliteConnection,
    account_id: &str,
    token_id: &str,
    expires_at: DateTime<Utc>,
    ctx: &RequestContext,
) -> AuthResult<()> {
    sqlx::query(
        "INSERT INTO session (token_id, account_id, issued_at, expires_at, ip, user_agent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(token_id)
    .bind(account_id)
    .bind(Utc::now())
    .bind(expires_at)
    .bind(&ctx.ip)
    .bind(&ctx.user_agent)
    .execute(conn)
    .await?;

    Ok(())
}

/// Revoke one token. Returns false if it was already revoked or unknown.
pub async fn revoke(
    conn: &mut SqliteConnection,
    token_id: &str,
    reason: RevokeReason,
) -> AuthResult<bool> {
    let result = sqlx::query(
        "UPDATE session SET revoked_at = ?1, revoked_reason = ?2
         WHERE token_id = ?3 AND revoked_at IS NULL",
    )
    .bind(Utc::now())
    .bind(reason.as_str())
    .bind(token_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Revoke every live session of an account in one statement
pub async fn revoke_all(
    conn: &mut SqliteConnection,
    account_id: &str,
    reason: RevokeReason,
) -> AuthResult<u64> {
    let result = sqlx::query(
        "UPDATE session SET revoked_at = ?1, revoked_reason = ?2
         WHERE account_id = ?3 AND revoked_at IS NULL",
    )
    .bind(Utc::now())
    .bind(reason.as_str())
    .bind(account_id)
    .execute(conn)
    .await?;

    let revoked = result.rows_affected();
    if revoked > 0 {
        tracing::info!(account_id, revoked, reason = reason.as_str(), "revoked sessions");
    }

    Ok(revoked)
}

/// Unknown token ids count as revoked
pub async fn is_revoked(conn: &mut SqliteConnection, token_id: &str) -> AuthResult<bool> {
    let revoked_at: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT revoked_at FROM session WHERE token_id = ?1")
            .bind(token_id)
            .fetch_optional(conn)
            .await?;

    Ok(match revoked_at {
        Some(revoked_at) => revoked_at.is_some(),
        None => true,
    })
}

/// Look up a session row
pub async fn get(conn: &mut SqliteConnection, token_id: &str) -> AuthResult<Option<SessionRecord>> {
    let record = sqlx::query_as::<_, SessionRecord>(&format!(
        "SELECT {} FROM session WHERE token_id = ?1",
        SESSION_COLUMNS
    ))
    .bind(token_id)
    .fetch_optional(conn)
    .await?;

    Ok(record)
}

/// Live sessions of an account, newest first
pub async fn active_sessions(
    conn: &mut SqliteConnection,
    account_id: &str,
) -> AuthResult<Vec<SessionRecord>> {
    let records = sqlx::query_as::<_, SessionRecord>(&format!(
        "SELECT {} FROM session
         WHERE account_id = ?1 AND revoked_at IS NULL AND expires_at > ?2
         ORDER BY issued_at DESC",
        SESSION_COLUMNS
    ))
    .bind(account_id)
    .bind(Utc::now())
    .fetch_all(conn)
    .await?;

    Ok(records)
}

/// Claim a session row for rotation.
///
/// The conditional update is the claim: of two concurrent callers only one
/// sees a row come back. A row that was already revoked by a previous
/// rotation means the token is being replayed.
pub async fn consume(
    conn: &mut SqliteConnection,
    token_id: &str,
    successor_id: &str,
) -> AuthResult<SessionRecord> {
    let now = Utc::now();

    let claimed = sqlx::query_as::<_, SessionRecord>(&format!(
        "UPDATE session SET revoked_at = ?1, revoked_reason = ?2, replaced_by = ?3
         WHERE token_id = ?4 AND revoked_at IS NULL
         RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(now)
    .bind(RevokeReason::Rotated.as_str())
    .bind(successor_id)
    .bind(token_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(record) = claimed {
        if record.expires_at <= now {
            return Err(AuthError::RefreshInvalid);
        }
        return Ok(record);
    }

    match get(conn, token_id).await? {
        Some(record) if record.revoked_reason.as_deref() == Some(RevokeReason::Rotated.as_str()) => {
            Err(AuthError::ReuseDetected {
                account_id: record.account_id,
            })
        }
        _ => Err(AuthError::RefreshInvalid),
    }
}
