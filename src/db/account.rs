/// Account database models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// Columns selected whenever a full `Account` is loaded
pub const ACCOUNT_COLUMNS: &str = "id, username, email, password_hash, status, failed_attempts,
    lock_expiry, password_changed_at, must_change_password, last_login_at, last_login_ip,
    created_at, updated_at, created_by, updated_by, deleted_at";

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Active,
    Inactive,
    Blocked,
    Pending,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Inactive => "INACTIVE",
            AccountStatus::Blocked => "BLOCKED",
            AccountStatus::Pending => "PENDING",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(AccountStatus::Active),
            "INACTIVE" => Ok(AccountStatus::Inactive),
            "BLOCKED" => Ok(AccountStatus::Blocked),
            "PENDING" => Ok(AccountStatus::Pending),
            other => Err(format!("Invalid account status: {}", other)),
        }
    }
}

/// Account record in the database
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub status: AccountStatus,
    pub failed_attempts: u32,
    pub lock_expiry: Option<DateTime<Utc>>,
    pub password_changed_at: DateTime<Utc>,
    pub must_change_password: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Account that created this one (None for self-registration)
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Time left on an active lock, if any
    pub fn lock_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.lock_expiry
            .filter(|expiry| *expiry > now)
            .map(|expiry| expiry - now)
    }
}

impl<'r> FromRow<'r, SqliteRow> for Account {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: e.into(),
        })?;
        let failed_attempts: i64 = row.try_get("failed_attempts")?;

        Ok(Account {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            status,
            failed_attempts: failed_attempts.max(0) as u32,
            lock_expiry: row.try_get("lock_expiry")?,
            password_changed_at: row.try_get("password_changed_at")?,
            must_change_password: row.try_get("must_change_password")?,
            last_login_at: row.try_get("last_login_at")?,
            last_login_ip: row.try_get("last_login_ip")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            created_by: row.try_get("created_by")?,
            updated_by: row.try_get("updated_by")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

/// Refresh-token record. `token_id` is the token's `jti`, never the token.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub token_id: String,
    pub account_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub replaced_by: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Login attempt audit row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttempt {
    pub id: i64,
    pub credential: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub account_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Inactive,
            AccountStatus::Blocked,
            AccountStatus::Pending,
        ] {
            assert_eq!(status.as_str().parse::<AccountStatus>().unwrap(), status);
        }
        assert_eq!("blocked".parse::<AccountStatus>().unwrap(), AccountStatus::Blocked);
        assert!("DELETED".parse::<AccountStatus>().is_err());
    }
}
