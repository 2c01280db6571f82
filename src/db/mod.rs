//! Postgres connection pool, migrations, and health check.
//!
//! `Db` is the production [`JobStore`](crate::store::JobStore); see
//! [`jobs`] for the queries.

pub mod jobs;

use crate::clock::Clock;
use crate::error::Result;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    ///
    /// A scheduling cycle needs at most a couple of connections at a time.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Database time minus `clock` time.
    ///
    /// Every timestamp in `jobs` comes from the writing host's clock, so
    /// workers and the janitor must agree on "now" to well within one
    /// heartbeat interval.
    pub async fn clock_skew(&self, clock: &dyn Clock) -> Result<TimeDelta> {
        let before = clock.now();
        let (db_now,): (DateTime<Utc>,) = sqlx::query_as("SELECT now()")
            .fetch_one(&self.pool)
            .await?;
        let after = clock.now();
        let local = before + (after - before) / 2;
        Ok(db_now - local)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
