//! SQLite-backed key-value storage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{KeyValueStore, StoredValue};

/// Schema for namespaced key-value tables.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_kv_store_seq ON kv_store(namespace, seq);
"#;

/// Shared connection to the sync database.
#[derive(Clone)]
pub struct SqliteDatabase {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory database, mostly useful in tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("sheetsync").join("sync.db"))
  }

  /// A store scoped to `namespace` within this database.
  pub fn namespace(&self, namespace: &str) -> SqliteStore {
    SqliteStore {
      conn: Arc::clone(&self.conn),
      namespace: namespace.to_string(),
    }
  }
}

/// One namespace of a [`SqliteDatabase`].
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
  namespace: String,
}

impl SqliteStore {
  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<StoredValue>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, stored_at FROM kv_store WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}/{}: {}", self.namespace, key, e))?;

    match row {
      Some((data, stored_at)) => Ok(Some(StoredValue {
        data,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, key: &str, data: &[u8]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (namespace, key, data, stored_at, seq)
         VALUES (?, ?, ?, ?,
           (SELECT COALESCE(MAX(seq), 0) + 1 FROM kv_store WHERE namespace = ?))",
        params![
          self.namespace,
          key,
          data,
          Utc::now().to_rfc3339(),
          self.namespace
        ],
      )
      .map_err(|e| eyre!("Failed to store {}/{}: {}", self.namespace, key, e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
      )
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", self.namespace, key, e))?;

    Ok(())
  }

  fn get_all(&self) -> Result<Vec<(String, StoredValue)>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, data, stored_at FROM kv_store WHERE namespace = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map(params![self.namespace], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to list {}: {}", self.namespace, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read row in {}: {}", self.namespace, e))?;

    rows
      .into_iter()
      .map(|(key, data, stored_at)| {
        let stored_at = parse_datetime(&stored_at)?;
        Ok((key, StoredValue { data, stored_at }))
      })
      .collect()
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
