//! Response cache over a durable key-value store.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::traits::{CachedEntry, KeyScope};
use crate::storage::KeyValueStore;
use crate::sync::{RemoteRequest, Verb};

/// Cache of the last known payload per resource.
///
/// Every failure in here is logged and degraded to a miss; callers never see
/// a cache error.
pub struct ResponseCache {
  store: Arc<dyn KeyValueStore>,
  scope: KeyScope,
  /// Keys invalidated since they were last fetched
  stale: Mutex<HashSet<String>>,
}

impl ResponseCache {
  /// Create a new cache with the given storage backend.
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      store,
      scope: KeyScope::Exact,
      stale: Mutex::new(HashSet::new()),
    }
  }

  /// Set how resource ids map to cache keys.
  pub fn with_scope(mut self, scope: KeyScope) -> Self {
    self.scope = scope;
    self
  }

  pub fn key_for(&self, resource: &str) -> String {
    self.scope.key_for(resource)
  }

  pub fn get(&self, key: &str) -> Option<CachedEntry> {
    let stored = match self.store.get(key) {
      Ok(Some(stored)) => stored,
      Ok(None) => return None,
      Err(e) => {
        warn!("Cache read failed for {}: {}", key, e);
        return None;
      }
    };

    match serde_json::from_slice(&stored.data) {
      Ok(payload) => Some(CachedEntry {
        key: key.to_string(),
        payload,
        cached_at: stored.stored_at,
        stale: self.stale_keys().contains(key),
      }),
      Err(e) => {
        warn!("Discarding corrupt cache entry {}: {}", key, e);
        None
      }
    }
  }

  pub fn contains(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  /// Overwrite the entry for `key` with freshly fetched data.
  pub fn put(&self, key: &str, payload: &Value) {
    if self.write(key, payload) {
      self.stale_keys().remove(key);
    }
  }

  /// Mark `key` stale. The entry is kept as an offline fallback but no longer
  /// satisfies a read on its own.
  pub fn invalidate(&self, key: &str) {
    debug!("Invalidating cache entry {}", key);
    self.stale_keys().insert(key.to_string());
  }

  fn stale_keys(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
    self.stale.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self, key: &str, payload: &Value) -> bool {
    let data = match serde_json::to_vec(payload) {
      Ok(data) => data,
      Err(e) => {
        warn!("Failed to serialize cache entry {}: {}", key, e);
        return false;
      }
    };

    match self.store.put(key, &data) {
      Ok(()) => true,
      Err(e) => {
        warn!("Cache write failed for {}: {}", key, e);
        false
      }
    }
  }

  /// Replace an existing entry with `f(current)`. Nothing happens when the key
  /// is not cached or `f` returns `None`. A stale entry stays stale.
  pub fn update_with<F>(&self, key: &str, f: F)
  where
    F: FnOnce(Value) -> Option<Value>,
  {
    if let Some(entry) = self.get(key) {
      if let Some(updated) = f(entry.payload) {
        self.write(key, &updated);
      }
    }
  }

  /// Reflect a write in the cache: appended rows are added to the cached
  /// table, and with exact keys updates replace and clears empty the entry.
  pub fn apply_write(&self, request: &RemoteRequest) {
    let key = self.key_for(&request.resource);
    let exact = self.scope.is_exact();
    let rows = request.rows().unwrap_or_default();

    debug!("Applying {} to cache entry {}", request.verb, key);

    match request.verb {
      Verb::Read => {}
      Verb::Append => self.update_with(&key, |current| match current {
        Value::Array(mut existing) => {
          existing.extend(rows.into_iter().map(Value::from));
          Some(Value::Array(existing))
        }
        _ => None,
      }),
      Verb::Update if exact => self.update_with(&key, |_| Some(Value::from(rows))),
      Verb::Clear if exact => self.update_with(&key, |_| Some(Value::Array(Vec::new()))),
      // Positions inside a collection entry are unknown
      Verb::Update | Verb::Clear => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::{KeyValueStore, MemoryStore, StoredValue};
  use color_eyre::eyre::eyre;
  use serde_json::json;

  fn cache() -> ResponseCache {
    ResponseCache::new(Arc::new(MemoryStore::new()))
  }

  struct BrokenStore;

  impl KeyValueStore for BrokenStore {
    fn get(&self, _key: &str) -> color_eyre::Result<Option<StoredValue>> {
      Err(eyre!("disk gone"))
    }
    fn put(&self, _key: &str, _data: &[u8]) -> color_eyre::Result<()> {
      Err(eyre!("disk gone"))
    }
    fn delete(&self, _key: &str) -> color_eyre::Result<()> {
      Err(eyre!("disk gone"))
    }
    fn get_all(&self) -> color_eyre::Result<Vec<(String, StoredValue)>> {
      Err(eyre!("disk gone"))
    }
  }

  #[test]
  fn test_put_then_get() {
    let cache = cache();
    cache.put("Sheet1!A2:B", &json!([["x", "1"]]));

    let entry = cache.get("Sheet1!A2:B").unwrap();
    assert_eq!(entry.payload, json!([["x", "1"]]));
    assert!(!entry.stale);
    assert!(cache.contains("Sheet1!A2:B"));
    assert!(!cache.contains("Sheet2"));
  }

  #[test]
  fn test_invalidate_keeps_entry_until_next_put() {
    let cache = cache();
    cache.put("Sheet1!A2:B", &json!([["x", "1"]]));
    cache.invalidate("Sheet1!A2:B");

    let entry = cache.get("Sheet1!A2:B").unwrap();
    assert!(entry.stale);
    assert_eq!(entry.payload, json!([["x", "1"]]));

    // Optimistic patches do not refresh it
    cache.apply_write(&RemoteRequest::append("Sheet1!A2:B", vec![vec![json!("y")]]));
    assert!(cache.get("Sheet1!A2:B").unwrap().stale);

    cache.put("Sheet1!A2:B", &json!([["z", "2"]]));
    assert!(!cache.get("Sheet1!A2:B").unwrap().stale);
  }

  #[test]
  fn test_invalidate_missing_key_is_harmless() {
    let cache = cache();
    cache.invalidate("nothing");
    assert!(cache.get("nothing").is_none());

    cache.put("nothing", &json!([]));
    assert!(!cache.get("nothing").unwrap().stale);
  }

  #[test]
  fn test_storage_errors_are_misses() {
    let cache = ResponseCache::new(Arc::new(BrokenStore));
    cache.put("k", &json!([]));
    assert!(cache.get("k").is_none());
  }

  #[test]
  fn test_corrupt_entry_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    store.put("k", b"{not json").unwrap();
    let cache = ResponseCache::new(store);
    assert!(cache.get("k").is_none());
  }

  #[test]
  fn test_update_with_skips_missing_entries() {
    let cache = cache();
    cache.update_with("k", |_| Some(json!([1])));
    assert!(cache.get("k").is_none());
  }

  #[test]
  fn test_apply_append_extends_rows() {
    let cache = cache();
    cache.put("Sheet1!A2:B", &json!([["a", "1"]]));

    cache.apply_write(&RemoteRequest::append(
      "Sheet1!A2:B",
      vec![vec![json!("b"), json!("2")]],
    ));

    assert_eq!(
      cache.get("Sheet1!A2:B").unwrap().payload,
      json!([["a", "1"], ["b", "2"]])
    );
  }

  #[test]
  fn test_apply_update_and_clear_with_exact_keys() {
    let cache = cache();
    cache.put("Sheet1!A2:B2", &json!([["a", "1"]]));

    cache.apply_write(&RemoteRequest::update(
      "Sheet1!A2:B2",
      vec![vec![json!("z"), json!("9")]],
    ));
    assert_eq!(cache.get("Sheet1!A2:B2").unwrap().payload, json!([["z", "9"]]));

    cache.apply_write(&RemoteRequest::clear("Sheet1!A2:B2"));
    assert_eq!(cache.get("Sheet1!A2:B2").unwrap().payload, json!([]));
  }

  #[test]
  fn test_collection_scope_only_patches_appends() {
    let cache = cache().with_scope(KeyScope::Collection { separator: '!' });
    cache.put("todos", &json!([["1", "run"]]));

    cache.apply_write(&RemoteRequest::update(
      "Todos!A2:B2",
      vec![vec![json!("1"), json!("walk")]],
    ));
    cache.apply_write(&RemoteRequest::clear("Todos!A2:B2"));
    assert_eq!(cache.get("todos").unwrap().payload, json!([["1", "run"]]));

    cache.apply_write(&RemoteRequest::append(
      "Todos!A2:B",
      vec![vec![json!("2"), json!("swim")]],
    ));
    assert_eq!(
      cache.get("todos").unwrap().payload,
      json!([["1", "run"], ["2", "swim"]])
    );
  }
}
