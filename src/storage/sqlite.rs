//! Durable key-value backend on SQLite.
//!
//! One table, one row per key. `insert_if_absent` relies on the primary key
//! constraint and `compare_and_swap` on a version-guarded `UPDATE`, so the
//! stores get at-most-one-writer semantics even with several processes
//! sharing the database file.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use super::{KeyValueStore, Versioned};
use crate::error::StorageError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS relay_kv (
    key     TEXT PRIMARY KEY NOT NULL,
    value   BLOB NOT NULL,
    version INTEGER NOT NULL
)";

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

fn db_error(err: rusqlite::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

impl SqliteKv {
    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(db_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_error)?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(db_error)?;
        Self::init(conn)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().map_err(db_error)?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(SCHEMA, []).map_err(db_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("sqlite connection lock poisoned".into()))?;
        f(&conn).map_err(db_error)
    }
}

impl KeyValueStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value, version FROM relay_kv WHERE key = ?1",
                params![key],
                |row| {
                    Ok(Versioned {
                        value: row.get(0)?,
                        version: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
        })
    }

    fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO relay_kv (key, value, version) VALUES (?1, ?2, 1)
                 ON CONFLICT(key) DO NOTHING",
                params![key, value],
            )
        })?;
        Ok(changed == 1)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: &[u8],
    ) -> Result<bool, StorageError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE relay_kv SET value = ?3, version = version + 1
                 WHERE key = ?1 AND version = ?2",
                params![key, expected as i64, value],
            )
        })?;
        Ok(changed == 1)
    }

    fn delete_if_version(&self, key: &str, expected: u64) -> Result<bool, StorageError> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM relay_kv WHERE key = ?1 AND version = ?2",
                params![key, expected as i64],
            )
        })?;
        Ok(changed == 1)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StorageError> {
        self.with_conn(|conn| {
            let upper = prefix_upper_bound(prefix);
            let mut stmt = conn.prepare(
                "SELECT key, value, version FROM relay_kv
                 WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)
                 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix, upper], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Versioned {
                        value: row.get(1)?,
                        version: row.get::<_, i64>(2)? as u64,
                    },
                ))
            })?;
            rows.collect()
        })
    }
}

/// Smallest string greater than every key starting with `prefix`, so a
/// prefix scan becomes a primary-key range. `None` when no such bound fits
/// in a string (empty prefix, or only `char::MAX` to bump).
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = (last as u32 + 1..=char::MAX as u32).find_map(char::from_u32);
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
