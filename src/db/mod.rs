mod migrations;
pub mod queries;


use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the activity database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        tracing::debug!("opening activity database at {}", path.display());
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database. Contents vanish with the handle.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        // partitions reference events, so foreign keys must be on before migrating
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in `_migrations`.
    pub fn schema_version(&self) -> Result<i64, DbError> {
        migrations::schema_version(&self.conn())
    }

    /// Acquire a lock on the connection for queries.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave sqlite half-written
        // outside a transaction, so the poisoned connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
