//! SQLite-backed fast store
//!
//! A single `kv` table in the app data directory. Uninstalling the app removes
//! the directory, which is exactly the survivability the fast tier promises.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{KeyValueStore, StorageError};

const DB_FILENAME: &str = "entitlements.db";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store at `<data_dir>/entitlements.db`
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            StorageError::Unavailable(format!("Failed to create data dir: {}", e))
        })?;

        let conn = Connection::open(data_dir.join(DB_FILENAME))
            .map_err(|e| StorageError::Unavailable(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Non-persistent store, handy for hosts without a data directory
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Unavailable(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#,
        )
        .map_err(|e| StorageError::Unavailable(format!("Failed to create tables: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StorageError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock()
            .execute(
                r#"
                INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, Utc::now().timestamp_millis()],
            )
            .map_err(|e| StorageError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        debug!(key, "Wrote fast store entry");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| StorageError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = SqliteStore::open(dir.path()).unwrap();
            store.set("device_id", "abc").unwrap();
            store.set("device_id", "def").unwrap();
        }

        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(store.get("device_id").unwrap().as_deref(), Some("def"));
        store.remove("device_id").unwrap();
        assert!(store.get("device_id").unwrap().is_none());
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("missing").unwrap().is_none());
        store.set("trial", r#"{"messagesUsed":2}"#).unwrap();
        assert_eq!(
            store.get("trial").unwrap().as_deref(),
            Some(r#"{"messagesUsed":2}"#)
        );
    }
}
