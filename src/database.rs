use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::StoreError;

/// Пул соединений PostgreSQL, общий для всех хранилищ движка.
#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            pool_size = config.pool_size,
            acquire_timeout_secs = config.acquire_timeout_secs,
            "🐘 Database pool ready"
        );
        Ok(Database { pool })
    }

    /// Схема реестров, броней и попыток оплаты.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running seat engine migrations...");
        sqlx::migrate!("./src/migrations").run(&self.pool).await?;
        info!("Migrations completed");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
