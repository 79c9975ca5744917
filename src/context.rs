/// Application context and dependency injection
use crate::{
    account::AuthService,
    config::ServerConfig,
    db,
    error::AuthResult,
    mailer::{Mailer, ResetNotifier},
    rbac::PermissionResolver,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub auth: Arc<AuthService>,
    pub resolver: PermissionResolver,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> AuthResult<Self> {
        // Refuse to start on missing or weak secrets
        config.validate()?;

        let db = db::create_pool(&config.storage.database, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let mailer = Mailer::new(config.email.clone(), config.service.public_url.clone())?;
        if !mailer.is_configured() {
            tracing::warn!("SMTP not configured, password reset emails will be dropped");
        }

        Self::with_notifier(config, db, Arc::new(mailer))
    }

    /// Build a context over an existing pool with a custom notifier
    pub fn with_notifier(
        config: ServerConfig,
        db: SqlitePool,
        notifier: Arc<dyn ResetNotifier>,
    ) -> AuthResult<Self> {
        let auth = Arc::new(AuthService::new(db.clone(), &config, notifier)?);

        Ok(Self {
            resolver: PermissionResolver::new(db.clone()),
            config: Arc::new(config),
            db,
            auth,
        })
    }
}
