//! Persistence layer for jobs and chunks.
//!
//! - [`models`]: row structs and DTOs.
//! - [`repositories`]: zero-sized Postgres repositories.
//! - [`store`]: the [`JobStore`] trait with Postgres and in-memory backends.
//! - [`commit`]: the retrying commit wrapper every Postgres write goes through.

use sqlx::postgres::PgPoolOptions;

pub mod commit;
pub mod error;
pub mod models;
pub mod repositories;
pub mod store;

pub use commit::{with_commit_retry, CommitRetryConfig};
pub use error::{StoreError, StoreResult};
pub use store::memory::MemoryStore;
pub use store::postgres::PgJobStore;
pub use store::{ChunkChange, JobStore};

pub type DbPool = sqlx::PgPool;

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify connectivity.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
