/// Vigil - authentication, session and access control core
///
/// Issues and rotates tokens, enforces lockout and password policy, and
/// resolves role-based permissions for the citizen-security backend.

mod account;
mod api;
mod auth;
mod config;
mod context;
mod db;
mod error;
mod mailer;
mod metrics;
mod rbac;
mod server;
mod session;
mod token;

#[cfg(test)]
mod testutil;

use config::{LoggingConfig, ServerConfig};
use context::AppContext;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| "vigil=info,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    init_tracing(&config.logging);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting vigil");

    let ctx = AppContext::new(config).await?;

    server::serve(ctx).await?;

    Ok(())
}
