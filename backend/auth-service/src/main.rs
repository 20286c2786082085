/// Auth service entry point
use std::sync::Arc;

use anyhow::Context;
use auth_service::{
    config::Config,
    db::{self, PgCredentialStore, PgSessionLedger},
    logging, AuthSessionManager,
};
use jwt_security::TokenIssuer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    tracing::info!(?config, "Starting auth-service");

    let pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    tracing::info!("Database connection pool initialized");

    db::MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let issuer = TokenIssuer::new(&config.access_secret, &config.refresh_secret)
        .context("Failed to initialize token issuer")?;

    let _manager = AuthSessionManager::new(
        Arc::new(PgCredentialStore::new(pool.clone())),
        Arc::new(PgSessionLedger::new(pool.clone())),
        Arc::new(issuer),
    );
    tracing::info!("Auth session manager ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down auth-service");
    pool.close().await;
    Ok(())
}
