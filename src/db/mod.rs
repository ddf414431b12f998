//! Database connection pool, migrations, and health check.
//!
//! Shared Postgres connection pool used by the record store and the
//! LISTEN/NOTIFY pool bus.

pub mod notify;
pub mod work;

pub use notify::PgBus;
pub use work::PgWorkStore;

use crate::error::Result;
use crate::model::Payload;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Health check: `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Record store for one work type.
    pub fn work_store<P: Payload>(&self, work_type: impl Into<String>) -> PgWorkStore<P> {
        PgWorkStore::new(self.pool.clone(), work_type)
    }

    /// Pool bus over LISTEN/NOTIFY on this database.
    pub fn bus(&self) -> PgBus {
        PgBus::new(self.pool.clone())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
