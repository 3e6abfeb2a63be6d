//! SQLite database connection management.
//!
//! Every durable piece of indexing state lives in one SQLite file: jobs,
//! actions, revisions, chunk sets, document rows and document locks.
//! Worker processes on the same host share that file, so all coordination
//! between them (job claiming, lock acquisition, revision switchover) is
//! expressed as single conditional SQL statements.
//!
//! # Write-Ahead Logging (WAL)
//!
//! WAL mode lets the admin CLI read actions and jobs while a worker is
//! writing. A busy timeout makes concurrent writers wait for each other
//! instead of failing immediately with `SQLITE_BUSY`.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Create a connection pool to the configured SQLite database.
///
/// Creates the database file and its parent directories if they don't exist.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Current wall-clock time in epoch milliseconds, the unit of every
/// timestamp column.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
