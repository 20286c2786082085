use std::sync::Arc;

use anyhow::Context;
use messaging_service::{
    config::{Config, StoreBackend},
    db, logging, BrokerHandle, InMemoryMessageStore, MessageRelay, MessageStore,
    NotificationHub, PgMessageStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    tracing::info!(
        broker = ?config.broker_backend,
        store = ?config.store_backend,
        "Starting messaging-service"
    );

    let mut pool = None;
    let store: Arc<dyn MessageStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL missing")?;
            let db_pool = db::init_pool(database_url, config.database_max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            db::MIGRATOR
                .run(&db_pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database ready");
            pool = Some(db_pool.clone());
            Arc::new(PgMessageStore::new(db_pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory message store; messages are lost on restart");
            Arc::new(InMemoryMessageStore::new())
        }
    };

    let broker = Arc::new(BrokerHandle::new(config.broker_config()));
    broker
        .get()
        .await
        .context("Failed to initialize broker channel")?;

    let hub = NotificationHub::new();
    let _relay = MessageRelay::new(store, broker, Arc::new(hub.clone()));
    tracing::info!("Message relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down messaging-service");
    hub.close_all();
    if let Some(pool) = pool {
        pool.close().await;
    }
    Ok(())
}
