//! Database module for SQLite persistence
//!
//! Durable backing for upload sessions and the dedup index. Used in place of
//! the in-memory stores when a database URL is configured.

mod artifacts;
mod schema;
mod sessions;

pub use artifacts::*;
pub use schema::*;
pub use sessions::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::Result;

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text
pub(crate) fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(
    value: &str,
) -> std::result::Result<chrono::DateTime<chrono::Utc>, crate::upload::UploadError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&chrono::Utc))
        .map_err(|e| {
            crate::upload::UploadError::DatabaseError(format!("bad timestamp {:?}: {}", value, e))
        })
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    initialize_schema(&pool).await.unwrap();
    pool
}
