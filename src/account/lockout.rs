/// Brute-force lockout
///
/// Counters are only ever changed by single conditional UPDATE statements,
/// each the first write of its transaction, so SQLite serializes concurrent
/// attempts on the same account and the counter never passes the threshold.
use crate::{
    account::{
        audit::{self, FailureReason},
        hasher::PasswordHasher,
        store, RequestContext,
    },
    config::LockoutConfig,
    db::account::{Account, AccountStatus, ACCOUNT_COLUMNS},
    error::AuthResult,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Result of one login attempt
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Success(Account),
    /// `attempts_remaining` is None when the identifier matched nothing
    InvalidCredentials { attempts_remaining: Option<u32> },
    AccountLocked { remaining: Duration },
    AccountNotActive { status: AccountStatus },
}

/// Lockout-aware credential check
#[derive(Clone)]
pub struct LockoutManager {
    db: SqlitePool,
    hasher: PasswordHasher,
    config: LockoutConfig,
}

impl LockoutManager {
    pub fn new(db: SqlitePool, hasher: PasswordHasher, config: LockoutConfig) -> Self {
        Self { db, hasher, config }
    }

    async fn record(
        &self,
        credential: &str,
        account_id: Option<&str>,
        failure: Option<FailureReason>,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        let mut conn = self.db.acquire().await?;
        audit::record_attempt(&mut conn, credential, account_id, failure, ctx).await
    }

    /// Check a credential pair and apply the lockout policy
    pub async fn attempt(
        &self,
        identifier: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> AuthResult<LoginOutcome> {
        let credential = store::normalize_identifier(identifier);

        let account = {
            let mut conn = self.db.acquire().await?;
            store::find_by_identifier(&mut conn, &credential).await?
        };

        let Some(account) = account else {
            self.hasher.verify_dummy(password).await?;
            self.record(&credential, None, Some(FailureReason::UnknownIdentifier), ctx)
                .await?;
            tracing::debug!("login attempt for unknown identifier");
            return Ok(LoginOutcome::InvalidCredentials {
                attempts_remaining: None,
            });
        };

        if let Some(remaining) = account.lock_remaining(Utc::now()) {
            self.record(&credential, Some(&account.id), Some(FailureReason::Locked), ctx)
                .await?;
            tracing::debug!(account_id = %account.id, "login attempt while locked");
            return Ok(LoginOutcome::AccountLocked { remaining });
        }

        if account.status != AccountStatus::Active {
            self.record(&credential, Some(&account.id), Some(FailureReason::NotActive), ctx)
                .await?;
            return Ok(LoginOutcome::AccountNotActive {
                status: account.status,
            });
        }

        // No connection or transaction is held while Argon2 runs
        let verified = self.hasher.verify(password, &account.password_hash).await?;

        if verified {
            self.on_success(&credential, &account, ctx).await
        } else {
            self.on_failure(&credential, &account, ctx).await
        }
    }

    async fn on_failure(
        &self,
        credential: &str,
        account: &Account,
        ctx: &RequestContext,
    ) -> AuthResult<LoginOutcome> {
        let now = Utc::now();
        let max = self.config.max_attempts;
        let mut tx = self.db.begin().await?;

        // A lock that already ran out starts a fresh window
        sqlx::query(
            "UPDATE account SET failed_attempts = 0, lock_expiry = NULL
             WHERE id = ?1 AND lock_expiry IS NOT NULL AND lock_expiry <= ?2",
        )
        .bind(&account.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "UPDATE account
             SET failed_attempts = MIN(failed_attempts + 1, ?1),
                 lock_expiry = CASE WHEN failed_attempts + 1 >= ?1 THEN ?2 ELSE lock_expiry END,
                 updated_at = ?3
             WHERE id = ?4 AND deleted_at IS NULL AND (lock_expiry IS NULL OR lock_expiry <= ?3)
             RETURNING failed_attempts, lock_expiry",
        )
        .bind(max as i64)
        .bind(now + self.config.lock_duration)
        .bind(now)
        .bind(&account.id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match row {
            Some(row) => {
                let failed: i64 = row.try_get("failed_attempts")?;
                let lock_expiry: Option<DateTime<Utc>> = row.try_get("lock_expiry")?;

                audit::record_attempt(&mut tx, credential, Some(&account.id), Some(FailureReason::BadPassword), ctx)
                    .await?;

                match lock_expiry.filter(|expiry| *expiry > now) {
                    Some(expiry) => {
                        tracing::warn!(account_id = %account.id, failed, "account locked after repeated failures");
                        crate::metrics::record_lockout();
                        LoginOutcome::AccountLocked {
                            remaining: expiry - now,
                        }
                    }
                    None => LoginOutcome::InvalidCredentials {
                        attempts_remaining: Some(max.saturating_sub(failed.max(0) as u32)),
                    },
                }
            }
            // A concurrent attempt locked or removed the account first
            None => self.reload_outcome(&mut tx, credential, &account.id, now, ctx).await?,
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn on_success(
        &self,
        credential: &str,
        account: &Account,
        ctx: &RequestContext,
    ) -> AuthResult<LoginOutcome> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        // Reset only if nobody locked or deactivated the account since we read it
        let updated = sqlx::query_as::<_, Account>(&format!(
            "UPDATE account
             SET failed_attempts = 0, lock_expiry = NULL, last_login_at = ?1, last_login_ip = ?2
             WHERE id = ?3 AND status = 'ACTIVE' AND deleted_at IS NULL
               AND (lock_expiry IS NULL OR lock_expiry <= ?1)
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(now)
        .bind(&ctx.ip)
        .bind(&account.id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match updated {
            Some(updated) => {
                audit::record_attempt(&mut tx, credential, Some(&updated.id), None, ctx).await?;
                tracing::info!(account_id = %updated.id, "login succeeded");
                LoginOutcome::Success(updated)
            }
            None => self.reload_outcome(&mut tx, credential, &account.id, now, ctx).await?,
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Work out why a guarded update matched nothing
    async fn reload_outcome(
        &self,
        conn: &mut SqliteConnection,
        credential: &str,
        account_id: &str,
        now: DateTime<Utc>,
        ctx: &RequestContext,
    ) -> AuthResult<LoginOutcome> {
        let current = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM account WHERE id = ?1 AND deleted_at IS NULL",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?;

        let (failure, outcome) = match current {
            Some(current) => match current.lock_remaining(now) {
                Some(remaining) => (FailureReason::Locked, LoginOutcome::AccountLocked { remaining }),
                None => (
                    FailureReason::NotActive,
                    LoginOutcome::AccountNotActive {
                        status: current.status,
                    },
                ),
            },
            None => (
                FailureReason::UnknownIdentifier,
                LoginOutcome::InvalidCredentials {
                    attempts_remaining: None,
                },
            ),
        };

        let recorded_id = match failure {
            FailureReason::UnknownIdentifier => None,
            _ => Some(account_id),
        };
        audit::record_attempt(conn, credential, recorded_id, Some(failure), ctx).await?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use tempfile::TempDir;

    async fn manager() -> (SqlitePool, LockoutManager, TempDir) {
        let (pool, dir) = testutil::setup_pool().await;
        let config = testutil::test_config();
        let hasher = PasswordHasher::new(&config.password).unwrap();
        (pool.clone(), LockoutManager::new(pool, hasher, config.lockout), dir)
    }

    async fn counters(pool: &SqlitePool, id: &str) -> (i64, Option<DateTime<Utc>>) {
        let row = sqlx::query("SELECT failed_attempts, lock_expiry FROM account WHERE id = ?1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
        (row.get("failed_attempts"), row.get("lock_expiry"))
    }

    #[tokio::test]
    async fn test_bob_is_locked_on_fifth_failure() {
        let (pool, lockout, _dir) = manager().await;
        let bob = testutil::insert_account(&pool, "bob", "bob@example.com").await;
        let ctx = RequestContext::default();

        for expected_remaining in [4u32, 3, 2, 1] {
            match lockout.attempt("bob", "wrong password", &ctx).await.unwrap() {
                LoginOutcome::InvalidCredentials { attempts_remaining } => {
                    assert_eq!(attempts_remaining, Some(expected_remaining))
                }
                other => panic!("Expected InvalidCredentials, got {:?}", other),
            }
        }

        match lockout.attempt("bob", "wrong password", &ctx).await.unwrap() {
            LoginOutcome::AccountLocked { remaining } => {
                assert!(remaining > Duration::minutes(14));
                assert!(remaining <= Duration::minutes(15));
            }
            other => panic!("Expected AccountLocked, got {:?}", other),
        }

        // Even the right password is refused while locked
        assert!(matches!(
            lockout.attempt("bob", testutil::DEFAULT_PASSWORD, &ctx).await.unwrap(),
            LoginOutcome::AccountLocked { .. }
        ));

        let (failed, lock_expiry) = counters(&pool, &bob).await;
        assert_eq!(failed, 5);
        assert!(lock_expiry.is_some());

        let attempts = audit::recent_attempts(&pool, &bob, 10).await.unwrap();
        assert_eq!(attempts.len(), 6);
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("locked"));
        assert!(attempts.iter().all(|a| !a.success));
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (pool, lockout, _dir) = manager().await;
        let id = testutil::insert_account(&pool, "peggy", "peggy@example.com").await;
        let ctx = RequestContext {
            ip: Some("198.51.100.4".to_string()),
            ..Default::default()
        };

        lockout.attempt("peggy", "nope nope", &ctx).await.unwrap();
        lockout.attempt("peggy", "nope nope", &ctx).await.unwrap();
        assert_eq!(counters(&pool, &id).await.0, 2);

        match lockout.attempt("PEGGY@example.com", testutil::DEFAULT_PASSWORD, &ctx).await.unwrap() {
            LoginOutcome::Success(account) => {
                assert_eq!(account.failed_attempts, 0);
                assert!(account.lock_expiry.is_none());
                assert_eq!(account.last_login_ip.as_deref(), Some("198.51.100.4"));
                assert!(account.last_login_at.is_some());
            }
            other => panic!("Expected Success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_lock_starts_fresh_window() {
        let (pool, lockout, _dir) = manager().await;
        let id = testutil::insert_account(&pool, "quinn", "quinn@example.com").await;

        sqlx::query("UPDATE account SET failed_attempts = 5, lock_expiry = ?1 WHERE id = ?2")
            .bind(Utc::now() - Duration::minutes(1))
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        match lockout.attempt("quinn", "still wrong", &RequestContext::default()).await.unwrap() {
            LoginOutcome::InvalidCredentials { attempts_remaining } => {
                assert_eq!(attempts_remaining, Some(4))
            }
            other => panic!("Expected InvalidCredentials, got {:?}", other),
        }
        let (failed, lock_expiry) = counters(&pool, &id).await;
        assert_eq!(failed, 1);
        assert!(lock_expiry.is_none());
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_audited_without_account() {
        let (pool, lockout, _dir) = manager().await;

        assert!(matches!(
            lockout.attempt("ghost", "whatever", &RequestContext::default()).await.unwrap(),
            LoginOutcome::InvalidCredentials {
                attempts_remaining: None
            }
        ));

        let (credential, account_id): (String, Option<String>) =
            sqlx::query_as("SELECT credential, account_id FROM login_attempt")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(credential, "ghost");
        assert!(account_id.is_none());
    }

    #[tokio::test]
    async fn test_inactive_account_counter_untouched() {
        let (pool, lockout, _dir) = manager().await;
        let id = testutil::insert_account(&pool, "rupert", "rupert@example.com").await;
        sqlx::query("UPDATE account SET status = 'PENDING' WHERE id = ?1")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            lockout.attempt("rupert", "wrong password", &RequestContext::default()).await.unwrap(),
            LoginOutcome::AccountNotActive {
                status: AccountStatus::Pending
            }
        ));
        assert_eq!(counters(&pool, &id).await.0, 0);
    }

    #[tokio::test]
    async fn test_soft_deleted_never_authenticates() {
        let (pool, lockout, _dir) = manager().await;
        let id = testutil::insert_account(&pool, "sybil", "sybil@example.com").await;
        sqlx::query("UPDATE account SET deleted_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        // Status is still ACTIVE and the password is right
        assert!(matches!(
            lockout.attempt("sybil", testutil::DEFAULT_PASSWORD, &RequestContext::default()).await.unwrap(),
            LoginOutcome::InvalidCredentials {
                attempts_remaining: None
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_failures_never_exceed_threshold() {
        let (pool, lockout, _dir) = manager().await;
        let id = testutil::insert_account(&pool, "trent", "trent@example.com").await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let lockout = lockout.clone();
            tasks.spawn(async move {
                lockout
                    .attempt("trent", "wrong password", &RequestContext::default())
                    .await
                    .unwrap()
            });
        }

        let mut locked = 0;
        while let Some(outcome) = tasks.join_next().await {
            if matches!(outcome.unwrap(), LoginOutcome::AccountLocked { .. }) {
                locked += 1;
            }
        }

        let (failed, lock_expiry) = counters(&pool, &id).await;
        assert_eq!(failed, 5);
        assert!(lock_expiry.is_some());
        assert!(locked >= 1);
    }
}
