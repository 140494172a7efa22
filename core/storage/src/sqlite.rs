//! SQLite-backed durable store.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::store::{BatchOp, DurableStore};
use offsync_common::{Error, Result};

/// Schema for the key-value table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (namespace, key)
);
"#;

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Durable store persisted in a single SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// - Parent directory cannot be created
    /// - Database cannot be opened or migrated
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(storage_err)?;
        debug!("Opened sqlite store at {}", path.display());
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn, None)
    }

    /// Default database location under the user's data directory.
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
            .ok_or_else(|| Error::InvalidInput("Could not determine data directory".to_string()))?;

        Ok(data_dir.join("offsync").join("store.db"))
    }

    /// Path of the database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }
}

impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO entries (namespace, key, value) VALUES (?1, ?2, ?3)",
            params![namespace, key, value],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .map_err(storage_err)?;
        Ok(removed > 0)
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM entries WHERE namespace = ?1 ORDER BY key")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries WHERE namespace = ?1", params![namespace])
            .map_err(storage_err)
    }

    fn write_batch(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => tx.execute(
                    "INSERT OR REPLACE INTO entries (namespace, key, value) VALUES (?1, ?2, ?3)",
                    params![namespace, key, value],
                ),
                BatchOp::Delete { key } => tx.execute(
                    "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                ),
            }
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }
}
