/// Shared fixtures for unit tests
use crate::{
    account::{hasher::PasswordHasher, AuthService},
    config::{
        AuthConfig, LockoutConfig, LoggingConfig, PasswordConfig, ServerConfig, ServiceConfig,
        StorageConfig,
    },
    db::{self, account::{Account, AccountStatus}, DatabaseOptions},
    error::AuthResult,
    mailer::ResetNotifier,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{Notify, OnceCell};
use uuid::Uuid;

/// Password every fixture account starts with
pub const DEFAULT_PASSWORD: &str = "initial password";

static DEFAULT_HASH: OnceCell<String> = OnceCell::const_new();

/// Config with cheap Argon2 parameters and valid secrets
pub fn test_config() -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            hostname: "127.0.0.1".to_string(),
            port: 0,
            public_url: "http://localhost:8080".to_string(),
            request_timeout: std::time::Duration::from_secs(10),
        },
        storage: StorageConfig {
            database: std::env::temp_dir().join("vigil-unused.sqlite"),
        },
        authentication: AuthConfig {
            access_token_secret: "test-access-secret-0123456789abcdef".to_string(),
            refresh_token_secret: "test-refresh-secret-fedcba9876543210".to_string(),
            access_token_ttl: Duration::hours(2),
            refresh_token_ttl: Duration::days(7),
            token_leeway: Duration::zero(),
        },
        lockout: LockoutConfig::default(),
        password: PasswordConfig {
            hash_memory_kib: 1024,
            hash_iterations: 1,
            ..PasswordConfig::default()
        },
        email: None,
        logging: LoggingConfig {
            level: "vigil=debug".to_string(),
            json: false,
        },
    }
}

/// Fresh migrated database in its own temp directory. The directory, and
/// the database files with it, go away when the returned `TempDir` drops.
pub async fn setup_pool() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vigil-test.sqlite");
    let pool = db::create_pool(
        &path,
        DatabaseOptions {
            max_connections: 4,
            enable_wal: true,
        },
    )
    .await
    .unwrap();
    db::run_migrations(&pool).await.unwrap();
    (pool, dir)
}

async fn default_hash() -> String {
    DEFAULT_HASH
        .get_or_init(|| async {
            PasswordHasher::new(&test_config().password)
                .unwrap()
                .hash(DEFAULT_PASSWORD)
                .await
                .unwrap()
        })
        .await
        .clone()
}

/// Insert an ACTIVE account with `DEFAULT_PASSWORD`, returning its id
pub async fn insert_account(pool: &SqlitePool, username: &str, email: &str) -> String {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO account (id, username, email, password_hash, status, failed_attempts,
             password_changed_at, must_change_password, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'ACTIVE', 0, ?5, 0, ?5, ?5)",
    )
    .bind(&id)
    .bind(username.to_lowercase())
    .bind(email.to_lowercase())
    .bind(default_hash().await)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();

    id
}

/// Create a role granting `permissions` (slugs like `incidents.read`),
/// returning the role id
pub async fn seed_role(pool: &SqlitePool, slug: &str, level: i64, permissions: &[&str]) -> String {
    let role_id = Uuid::new_v4().to_string();

    sqlx::query("INSERT INTO role (id, slug, name, level, created_at) VALUES (?1, ?2, ?2, ?3, ?4)")
        .bind(&role_id)
        .bind(slug)
        .bind(level)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();

    for permission in permissions {
        let (resource, action) = permission.split_once('.').unwrap_or((*permission, "access"));

        sqlx::query(
            "INSERT OR IGNORE INTO permission (id, slug, module, resource, action)
             VALUES (?1, ?2, ?3, ?3, ?4)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(permission)
        .bind(resource)
        .bind(action)
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO role_permission (role_id, permission_id)
             SELECT ?1, id FROM permission WHERE slug = ?2",
        )
        .bind(&role_id)
        .bind(permission)
        .execute(pool)
        .await
        .unwrap();
    }

    role_id
}

/// Give an account an active role
pub async fn assign_role(pool: &SqlitePool, account_id: &str, role_id: &str) {
    sqlx::query(
        "INSERT INTO role_assignment (account_id, role_id, active, assigned_at) VALUES (?1, ?2, 1, ?3)",
    )
    .bind(account_id)
    .bind(role_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .unwrap();
}

/// In-memory account for token tests
pub fn sample_account() -> Account {
    let now = Utc::now();
    Account {
        id: "0b6a3c1e-5a8e-4c3e-9a55-3f1f6c2d7e90".to_string(),
        username: "alice".to_string(),
        email: "alice@example.com".to_string(),
        password_hash: String::new(),
        status: AccountStatus::Active,
        failed_attempts: 0,
        lock_expiry: None,
        password_changed_at: now,
        must_change_password: false,
        last_login_at: None,
        last_login_ip: None,
        created_at: now,
        updated_at: now,
        created_by: None,
        updated_by: None,
        deleted_at: None,
    }
}

/// Notifier that keeps raw reset tokens instead of mailing them
#[derive(Default)]
pub struct CapturingNotifier {
    tokens: Mutex<Vec<String>>,
    delivered: Notify,
}

impl CapturingNotifier {
    pub fn last_token(&self) -> Option<String> {
        self.tokens.lock().unwrap().last().cloned()
    }

    /// Latest token, waiting for detached delivery to land
    pub async fn wait_token(&self) -> String {
        loop {
            if let Some(token) = self.last_token() {
                return token;
            }
            tokio::time::timeout(std::time::Duration::from_secs(5), self.delivered.notified())
                .await
                .expect("reset token was never delivered");
        }
    }
}

#[async_trait]
impl ResetNotifier for CapturingNotifier {
    async fn send_password_reset(
        &self,
        _account: &Account,
        raw_token: &str,
        _expires_at: DateTime<Utc>,
    ) -> AuthResult<()> {
        self.tokens.lock().unwrap().push(raw_token.to_string());
        self.delivered.notify_one();
        Ok(())
    }
}

/// Auth service over `pool` with a capturing notifier
pub fn service(pool: &SqlitePool, config: ServerConfig) -> (AuthService, Arc<CapturingNotifier>) {
    let notifier = Arc::new(CapturingNotifier::default());
    let service = AuthService::new(pool.clone(), &config, notifier.clone()).unwrap();
    (service, notifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_files_removed_with_dir() {
        let (pool, dir) = setup_pool().await;
        let path = dir.path().to_path_buf();
        insert_account(&pool, "temp", "temp@example.com").await;
        assert!(path.join("vigil-test.sqlite").exists());

        pool.close().await;
        drop(dir);
        assert!(!path.exists());
    }
}
