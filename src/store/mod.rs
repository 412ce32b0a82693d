//! SQLite-backed operation store.
//!
//! Holds the three pieces of state shared between the intake API, the
//! processor and the vacuum daemon:
//! - operation records, keyed by UUID (this module)
//! - the FIFO dispatch queue with acknowledgement (`queue`)
//! - per-repository lock records and access markers (`lock`)
//!
//! A single connection sits behind a mutex; every statement is short so the
//! async callers take the lock directly.

mod lock;
mod queue;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Notify;

use crate::models::Operation;

pub use lock::LockToken;
pub use queue::Delivery;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored operation: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock unavailable for {0}")]
    LockUnavailable(String),

    #[error("store connection poisoned")]
    Poisoned,
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub struct Store {
    conn: Mutex<Connection>,
    queue_notify: Notify,
    visibility_timeout: Duration,
}

impl Store {
    /// Open or create the store database at the given path.
    pub fn open(path: &Path, visibility_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, visibility_timeout)
    }

    /// Create an in-memory store for testing
    pub fn in_memory(visibility_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, visibility_timeout)
    }

    fn with_connection(conn: Connection, visibility_timeout: Duration) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            queue_notify: Notify::new(),
            visibility_timeout,
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema. This is idempotent.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS operations (
                uuid TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                date INTEGER,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                claimed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS locks (
                repo_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repo_access (
                repo_id TEXT PRIMARY KEY,
                last_used INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert or replace an operation record.
    pub fn save(&self, op: &Operation) -> Result<(), StoreError> {
        let body = serde_json::to_string(op)?;
        let date = op.date.map(|d| d.timestamp_millis());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO operations (uuid, status, date, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uuid) DO UPDATE
             SET status = excluded.status, date = excluded.date, body = excluded.body",
            params![op.uuid, op.status.as_str(), date, body],
        )?;
        Ok(())
    }

    /// Load an operation, `None` when the UUID is unknown.
    pub fn load(&self, uuid: &str) -> Result<Option<Operation>, StoreError> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM operations WHERE uuid = ?1",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    pub fn list_operations(&self) -> Result<Vec<Operation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM operations ORDER BY uuid")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    pub fn delete_operation(&self, uuid: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM operations WHERE uuid = ?1", params![uuid])?;
        Ok(())
    }

    pub fn count_operations(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Cheap round trip used by the status endpoint.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    Store::in_memory(Duration::from_secs(60)).unwrap()
}

#[cfg(test)]
impl Store {
    /// Run raw SQL against the store, used to inject failures.
    pub(crate) fn run_sql(&self, sql: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckoutSetup, OperationSetup, OperationStatus, RepositoryStrategy};

    fn sample_operation(uuid: &str) -> Operation {
        Operation {
            uuid: uuid.to_string(),
            url: "https://example.com/org/repo.git".to_string(),
            repository_strategy: RepositoryStrategy {
                user: "bot".to_string(),
                password: "pw".to_string(),
                ..Default::default()
            },
            setup: OperationSetup {
                checkout: Some(CheckoutSetup {
                    branch: "main".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn save_then_load_returns_identical_operation() {
        let store = test_store();
        let op = sample_operation("a");

        store.save(&op).unwrap();
        let loaded = store.load("a").unwrap().unwrap();

        assert_eq!(loaded, op);
        assert_eq!(loaded.repository_strategy.password, "pw");
    }

    #[test]
    fn load_unknown_operation_is_none() {
        let store = test_store();
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn save_overwrites_existing_record() {
        let store = test_store();
        let mut op = sample_operation("a");
        store.save(&op).unwrap();

        op.fail("clone failed");
        store.save(&op).unwrap();

        let loaded = store.load("a").unwrap().unwrap();
        assert_eq!(loaded.status, OperationStatus::Error);
        assert_eq!(loaded.error.as_deref(), Some("clone failed"));
        assert_eq!(store.count_operations().unwrap(), 1);
    }

    #[test]
    fn delete_and_list_operations() {
        let store = test_store();
        store.save(&sample_operation("a")).unwrap();
        store.save(&sample_operation("b")).unwrap();

        store.delete_operation("a").unwrap();

        let remaining: Vec<String> = store
            .list_operations()
            .unwrap()
            .into_iter()
            .map(|op| op.uuid)
            .collect();
        assert_eq!(remaining, vec!["b".to_string()]);
    }

    #[test]
    fn open_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        Store::open(&path, Duration::from_secs(60))
            .unwrap()
            .save(&sample_operation("a"))
            .unwrap();

        let reopened = Store::open(&path, Duration::from_secs(60)).unwrap();
        assert!(reopened.load("a").unwrap().is_some());
    }
}
