//! Collapses identical concurrent remote calls onto one network operation.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::error::SyncError;

type CallResult = Result<Value, SyncError>;
type SharedCall = Shared<BoxFuture<'static, CallResult>>;
type Table = Arc<Mutex<HashMap<String, InFlight>>>;

struct InFlight {
  shared: SharedCall,
  started: Instant,
  generation: u64,
}

/// In-flight request table keyed by request id.
pub struct Deduplicator {
  entries: Table,
  /// Entries older than this are not joined
  window: Duration,
  /// How long a settled entry lingers before removal
  grace: Duration,
  next_generation: AtomicU64,
}

impl Deduplicator {
  pub fn new(window: Duration, grace: Duration) -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
      window,
      grace,
      next_generation: AtomicU64::new(0),
    }
  }

  /// Join the in-flight call for `request_id`, or start one with `make`.
  ///
  /// `make` is only invoked when no call younger than the window exists.
  pub async fn run<F>(&self, request_id: &str, make: F) -> CallResult
  where
    F: FnOnce() -> BoxFuture<'static, CallResult>,
  {
    let shared = {
      let mut entries = lock(&self.entries);

      match entries.get(request_id) {
        Some(existing) if existing.started.elapsed() < self.window => {
          debug!("Deduplicated request {}", request_id);
          existing.shared.clone()
        }
        _ => {
          // Entries past the window can no longer be joined. This also drops
          // calls whose every caller went away before they settled.
          let window = self.window;
          entries.retain(|_, e| e.started.elapsed() < window);

          let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
          let call = make();
          let table = Arc::clone(&self.entries);
          let id = request_id.to_string();
          let grace = self.grace;

          let shared = async move {
            let result = call.await;
            schedule_removal(table, id, generation, grace);
            result
          }
          .boxed()
          .shared();

          entries.insert(
            request_id.to_string(),
            InFlight {
              shared: shared.clone(),
              started: Instant::now(),
              generation,
            },
          );
          shared
        }
      }
    };

    shared.await
  }

  /// Number of registered calls, settled-but-lingering ones included.
  pub fn in_flight(&self) -> usize {
    lock(&self.entries).len()
  }
}

fn lock(table: &Table) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
  // The table holds no invariants a panic could break mid-update
  table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop the entry for `id` after `grace`, unless a newer call replaced it.
fn schedule_removal(table: Table, id: String, generation: u64, grace: Duration) {
  let remove = move || {
    let mut entries = lock(&table);
    if entries.get(&id).map(|e| e.generation) == Some(generation) {
      entries.remove(&id);
    }
  };

  if grace.is_zero() {
    remove();
  } else {
    tokio::spawn(async move {
      tokio::time::sleep(grace).await;
      remove();
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;

  fn slow_call(calls: &Arc<AtomicU32>, result: CallResult) -> BoxFuture<'static, CallResult> {
    let calls = Arc::clone(calls);
    async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(30)).await;
      result
    }
    .boxed()
  }

  #[tokio::test]
  async fn test_concurrent_calls_share_one_operation() {
    let dedup = Deduplicator::new(Duration::from_secs(30), Duration::from_millis(10));
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = tokio::join!(
      dedup.run("read:Sheet1", || slow_call(&calls, Ok(json!([["x"]])))),
      dedup.run("read:Sheet1", || slow_call(&calls, Ok(json!([["other"]])))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a, Ok(json!([["x"]])));
    assert_eq!(a, b);
  }

  #[tokio::test]
  async fn test_errors_are_shared_too() {
    let dedup = Deduplicator::new(Duration::from_secs(30), Duration::from_millis(10));
    let calls = Arc::new(AtomicU32::new(0));
    let err = SyncError::Status {
      status: 500,
      message: "boom".into(),
    };

    let (a, b) = tokio::join!(
      dedup.run("k", || slow_call(&calls, Err(err.clone()))),
      dedup.run("k", || slow_call(&calls, Ok(json!(null)))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a, Err(err));
    assert_eq!(a, b);
  }

  #[tokio::test]
  async fn test_different_ids_run_separately() {
    let dedup = Deduplicator::new(Duration::from_secs(30), Duration::ZERO);
    let calls = Arc::new(AtomicU32::new(0));

    let _ = tokio::join!(
      dedup.run("a", || slow_call(&calls, Ok(json!(1)))),
      dedup.run("b", || slow_call(&calls, Ok(json!(2)))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_entry_removed_after_grace() {
    let dedup = Deduplicator::new(Duration::from_secs(30), Duration::from_millis(20));
    let calls = Arc::new(AtomicU32::new(0));

    dedup.run("k", || slow_call(&calls, Ok(json!(1)))).await.unwrap();
    assert_eq!(dedup.in_flight(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(dedup.in_flight(), 0);

    // A later identical call goes to the network again
    dedup.run("k", || slow_call(&calls, Ok(json!(2)))).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_abandoned_calls_are_swept() {
    let dedup = Deduplicator::new(Duration::from_millis(20), Duration::from_secs(5));

    let abandoned = tokio::time::timeout(
      Duration::from_millis(5),
      dedup.run("never", || futures::future::pending::<CallResult>().boxed()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(dedup.in_flight(), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    dedup.run("other", || async { Ok::<_, SyncError>(json!(1)) }.boxed()).await.unwrap();

    // Only the settled call lingering in its grace period remains
    assert_eq!(dedup.in_flight(), 1);
  }

  #[tokio::test]
  async fn test_expired_window_starts_new_call() {
    let dedup = Deduplicator::new(Duration::ZERO, Duration::from_secs(5));
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = tokio::join!(
      dedup.run("k", || slow_call(&calls, Ok(json!("first")))),
      dedup.run("k", || slow_call(&calls, Ok(json!("second")))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(a, Ok(json!("first")));
    assert_eq!(b, Ok(json!("second")));
  }
}
