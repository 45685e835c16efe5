//! Rentline shared infrastructure
//!
//! Database pool construction and the embedded schema migrations used by
//! both the API server and the worker.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Pool settings for long-running services.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Create a database connection pool with default settings
pub async fn create_pool(database_url: &str) -> Result<PgPool, DbError> {
    create_pool_with(database_url, &PoolSettings::default()).await
}

pub async fn create_pool_with(
    database_url: &str,
    settings: &PoolSettings,
) -> Result<PgPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        "Database pool created"
    );
    Ok(pool)
}

/// Apply the embedded migrations in `migrations/`
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
