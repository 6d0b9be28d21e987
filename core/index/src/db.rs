//! Database connection and schema.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use driveline_common::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    subject TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    issued_at INTEGER NOT NULL,
    lifetime_secs INTEGER NOT NULL,
    scope TEXT
);

CREATE TABLE IF NOT EXISTS stored_objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_object_id TEXT NOT NULL UNIQUE,
    logical_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    uploaded_at INTEGER NOT NULL,
    uploader TEXT NOT NULL,
    owner TEXT NOT NULL,
    container_kind TEXT NOT NULL CHECK (container_kind IN ('product', 'order')),
    container_id INTEGER NOT NULL,
    UNIQUE (container_kind, container_id, logical_name)
);

CREATE INDEX IF NOT EXISTS idx_stored_objects_container
    ON stored_objects(container_kind, container_id);
"#;

/// Map a SQLite error into the common error type.
pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// Shared SQLite connection.
///
/// Statements are short and run under a mutex; callers share one
/// `Arc<Database>` between the token store and the metadata index.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create or open a database file and apply the schema.
    ///
    /// # Errors
    /// - Parent directory cannot be created
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let db = Self::init(conn)?;

        info!(path = %db_path.display(), "Local index opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Database("Connection lock poisoned".to_string()))?;
        f(&conn).map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.db");

        Database::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('credentials', 'stored_objects')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_container_kind_check_constraint() {
        let db = Database::in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO stored_objects (remote_object_id, logical_name, mime_type, size_bytes, uploaded_at, uploader, owner, container_kind, container_id)
                 VALUES ('r1', 'x', 'text/plain', 1, 0, 'u', 'service', 'invoice', 1)",
                [],
            )
        });
        assert!(matches!(result, Err(Error::Database(_))));
    }
}
