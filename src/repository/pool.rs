//! Async SQLite connection factory.
//!
//! diesel-async's `SyncConnectionWrapper` gives SQLite an async interface by
//! running queries on the blocking pool. SQLite connections are cheap, so a
//! fresh one is opened per request instead of pooling.

use std::path::Path;

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};

use tracing::warn;

use super::util::to_diesel_error;

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// Async SQLite connection.
pub type AsyncSqliteConnection = SyncConnectionWrapper<SqliteConnection>;

#[derive(Clone, Debug)]
pub struct AsyncSqlitePool {
    database_url: String,
}

impl AsyncSqlitePool {
    /// Accepts `sqlite:path`, a bare path, or `:memory:`.
    pub fn new(database_url: &str) -> Self {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            database_url: url.to_string(),
        }
    }

    pub fn from_path(db_path: &Path) -> Self {
        Self::new(&db_path.display().to_string())
    }

    /// Open a connection with foreign keys and a busy timeout enabled.
    pub async fn get(&self) -> Result<AsyncSqliteConnection, DieselError> {
        let mut conn = AsyncSqliteConnection::establish(&self.database_url)
            .await
            .map_err(to_diesel_error)?;
        // several workers share the file
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .await?;
        Ok(conn)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

/// Start a transaction that takes the write lock before its first read.
///
/// A deferred transaction that reads and then writes can fail with
/// SQLITE_BUSY when another writer holds the lock; this one waits on the
/// busy timeout instead.
pub async fn begin_immediate(conn: &mut AsyncSqliteConnection) -> Result<(), DieselError> {
    conn.batch_execute("BEGIN IMMEDIATE").await
}

/// Commit after `result` succeeded, otherwise roll back.
pub async fn end_transaction<T>(
    conn: &mut AsyncSqliteConnection,
    result: Result<T, DieselError>,
) -> Result<T, DieselError> {
    match result {
        Ok(value) => {
            conn.batch_execute("COMMIT").await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.batch_execute("ROLLBACK").await {
                warn!("Rollback failed: {}", rollback);
            }
            Err(e)
        }
    }
}
