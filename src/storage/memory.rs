//! Process-local key-value stores.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyValueStore, StoredValue};

/// In-memory store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
  entries: HashMap<String, (u64, StoredValue)>,
  next_seq: u64,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<StoredValue>> {
    let inner = self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(inner.entries.get(key).map(|(_, v)| v.clone()))
  }

  fn put(&self, key: &str, data: &[u8]) -> Result<()> {
    let mut inner = self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    inner.next_seq += 1;
    let seq = inner.next_seq;
    inner.entries.insert(
      key.to_string(),
      (
        seq,
        StoredValue {
          data: data.to_vec(),
          stored_at: Utc::now(),
        },
      ),
    );
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let mut inner = self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    inner.entries.remove(key);
    Ok(())
  }

  fn get_all(&self) -> Result<Vec<(String, StoredValue)>> {
    let inner = self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut all: Vec<_> = inner
      .entries
      .iter()
      .map(|(k, (seq, v))| (*seq, k.clone(), v.clone()))
      .collect();
    all.sort_by_key(|(seq, _, _)| *seq);
    Ok(all.into_iter().map(|(_, k, v)| (k, v)).collect())
  }
}

/// Store that doesn't keep anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<StoredValue>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _data: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn get_all(&self) -> Result<Vec<(String, StoredValue)>> {
    Ok(Vec::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_store_orders_by_last_write() {
    let store = MemoryStore::new();
    store.put("a", b"1").unwrap();
    store.put("b", b"2").unwrap();
    store.put("a", b"3").unwrap();

    let all = store.get_all().unwrap();
    assert_eq!(all[0].0, "b");
    assert_eq!(all[1].0, "a");
    assert_eq!(all[1].1.data, b"3");
  }

  #[test]
  fn test_noop_store_always_misses() {
    let store = NoopStore;
    store.put("a", b"1").unwrap();
    assert!(store.get("a").unwrap().is_none());
    assert!(store.get_all().unwrap().is_empty());
  }
}
