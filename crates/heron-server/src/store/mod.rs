//! The relational store.
//!
//! SQLite behind a single shared connection; the database is the single
//! source of truth, and every in-memory cache derives from it. Model
//! functions take `&Connection` so they compose inside transactions.

pub mod app;
pub mod event;
pub mod host;
pub mod machine;
pub mod metrics;
pub mod migrations;
pub mod review;
pub mod secret;
pub mod settings;
pub mod statistic;
pub mod subnet;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use heron_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("malformed stored JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, message)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(
                    message.clone().unwrap_or_else(|| "constraint violation".to_string()),
                )
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("row"),
            _ => StoreError::Sqlite(e),
        }
    }
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::Conflict(_) => ErrorCode::Conflict,
            StoreError::Serde(_) => ErrorCode::InvalidInput,
            StoreError::Sqlite(_) | StoreError::Migration(_) => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the SQLite database, cloneable across tasks.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Db> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Migration(format!("cannot create {parent:?}: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Db> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open without touching the schema. The admin tool owns migrations
    /// explicitly; the server uses `open`, which migrates on boot.
    pub fn open_without_migrations(path: &Path) -> Result<Db> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: Connection) -> Result<Db> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let db = Db {
            conn: Arc::new(Mutex::new(conn)),
        };
        migrations::migrate_up(&db.connection(), None)?;
        Ok(db)
    }

    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run `f` inside a transaction. Errors roll back.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.connection();
        let tx = guard.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_migrates_to_latest() {
        let db = Db::open_in_memory().unwrap();
        let version = migrations::current_version(&db.connection()).unwrap();
        assert_eq!(version, migrations::latest_version());
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        let result: Result<()> = db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO setting (name, value) VALUES ('x', '1')",
                [],
            )?;
            Err(StoreError::Conflict("forced".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM setting WHERE name = 'x'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let db = Db::open_in_memory().unwrap();
        let insert = |conn: &Connection| {
            conn.execute(
                "INSERT INTO machine (created_at, address, agent_port) \
                 VALUES ('2026-01-01T00:00:00Z', 'pond', 8140)",
                [],
            )
        };
        insert(&db.connection()).unwrap();
        let err: StoreError = insert(&db.connection()).unwrap_err().into();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(err.code(), ErrorCode::Conflict);
    }
}
