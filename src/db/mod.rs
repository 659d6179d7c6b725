//! Database connection pool, migrations, and health check.
//!
//! Shared Postgres connection pool used by the event store, the summary
//! rollups, and the pgmq queue operations.

pub mod events;
pub mod queue;
pub mod summaries;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

use crate::error::{Error, Result};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Connect with fixed-interval retries. Startup waits out a database
    /// that is still coming up rather than crash-looping.
    pub async fn connect_with_retry(url: &str, attempts: u32, delay: Duration) -> Result<Self> {
        let mut last_err = Error::Internal("database connect failed".to_string());
        for attempt in 1..=attempts {
            match Self::connect(url).await {
                Ok(db) => return Ok(db),
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = attempts,
                        "failed to connect to database, retrying"
                    );
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err)
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
