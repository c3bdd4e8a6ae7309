//! Durable key-value storage used for both the response cache and the
//! mutation queue.
//!
//! Backends:
//! - `SqliteStore`: one database file, one namespace per logical store
//! - `MemoryStore`: process-local, for tests and ephemeral sessions
//! - `NoopStore`: discards everything (caching disabled)

mod memory;
mod sqlite;

use chrono::{DateTime, Utc};
use color_eyre::Result;

pub use memory::{MemoryStore, NoopStore};
pub use sqlite::{SqliteDatabase, SqliteStore};

/// A value read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
  pub data: Vec<u8>,
  /// When the value was last written
  pub stored_at: DateTime<Utc>,
}

/// Trait for durable key-value backends.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<StoredValue>>;

  /// Insert or overwrite `key`.
  fn put(&self, key: &str, data: &[u8]) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// All entries in the order they were last written.
  fn get_all(&self) -> Result<Vec<(String, StoredValue)>>;
}
