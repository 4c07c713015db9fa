//! Vigil remote-store layer.
//!
//! - [`store::RemoteStore`] -- the query + mutation contract every adapter
//!   implements.
//! - [`memory::MemoryStore`] -- in-process adapter with a built-in change
//!   feed, used by tests and local development.
//! - [`postgres::PgStore`] / [`postgres::PgChangeFeed`] -- PostgreSQL adapter
//!   with `LISTEN/NOTIFY` change delivery.
//! - [`repositories`] -- presence and activity-log access on top of any
//!   [`store::RemoteStore`].

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod query;
pub mod repositories;
pub mod store;

use sqlx::postgres::PgPoolOptions;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use query::{Order, SelectQuery};
pub use store::RemoteStore;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Verify the pool can reach the database.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
