pub mod memory;
pub mod session_repo;
pub mod user_repo;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

pub use memory::{InMemoryCredentialStore, InMemorySessionLedger};
pub use session_repo::{PgSessionLedger, SessionLedger};
pub use user_repo::{CredentialStore, PgCredentialStore};

/// Embedded schema migrations for the `users` and `sessions` tables
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create the Postgres connection pool
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}
