//! Durable stores backed by SQLite.
//!
//! The incoming store buffers raw samples until every frequency has rolled
//! them up; the long-term store holds committed aggregates. Each lives in its
//! own database file so ingestion never contends with aggregate readers.

pub mod incoming;
pub mod longterm;

use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

use crate::config::StorageConfig;
use crate::sample::Timestamp;

pub use incoming::{Ack, Handle, IncomingStore, Replayed};
pub use longterm::LongTermStore;

/// SQLite primary result codes that indicate the database could not accept
/// the operation right now.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;

/// Errors surfaced by both durable stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Storage temporarily cannot serve the request (locked, full, I/O).
    /// Callers retry with backoff.
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// An aggregate with the same key but a different payload already exists.
    #[error("conflicting aggregate for {metric} ({frequency}) at {bucket_start}")]
    Conflict {
        metric: String,
        frequency: String,
        bucket_start: Timestamp,
    },

    /// A sample carries a NaN or infinite value. Such values cannot be
    /// aggregated and are refused before anything is stored.
    #[error("non-finite value {value} for metric {metric}")]
    NonFinite { metric: String, value: f64 },

    /// A row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_transient(&e) {
            Self::Unavailable(e)
        } else {
            Self::Database(e)
        }
    }
}

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| {
                matches!(
                    code & 0xff,
                    SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_FULL | SQLITE_CANTOPEN
                )
            }),
        _ => false,
    }
}

/// Opens a WAL-mode connection pool on `path`, creating the file and its
/// parent directories when missing.
pub async fn connect(path: &Path, cfg: &StorageConfig) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(sqlx::Error::Io(e)))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(cfg.busy_timeout)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(cfg.acquire_timeout)
        .connect_with(options)
        .await?;

    tracing::debug!(path = %path.display(), "opened sqlite pool");

    Ok(pool)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(StoreError::from(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn test_other_errors_are_not_transient() {
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());

        let conflict = StoreError::Conflict {
            metric: "m".to_string(),
            frequency: "tensecond".to_string(),
            bucket_start: Timestamp::from_millis(0),
        };
        assert!(!conflict.is_transient());
        assert!(conflict.to_string().contains("conflicting aggregate for m"));
    }

    #[tokio::test]
    async fn test_connect_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/metrics.db");
        let pool = connect(&path, &StorageConfig::default()).await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");
        assert!(path.exists());
    }
}
