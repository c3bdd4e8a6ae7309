//! Offline-tolerant sync client.

use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dedup::Deduplicator;
use super::error::SyncError;
use super::queue::{MutationQueue, ReplayReport};
use super::retry::RetryPolicy;
use super::types::{
  normalize_rows, ApiResponse, DataSource, PendingMutation, ReadPolicy, RemoteRequest, Rows, Verb,
};
use crate::cache::{CachedEntry, KeyScope, ResponseCache};
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::remote::{AccessToken, TokenProvider, Transport};
use crate::storage::{KeyValueStore, MemoryStore};

/// Client for a remote row store that keeps working while offline.
///
/// Reads are cache-first with stale fallback, identical concurrent calls are
/// deduplicated, remote calls are retried with backoff, and writes issued
/// offline are queued durably and replayed on reconnect.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncClient {
  inner: Arc<Inner>,
}

struct Inner {
  transport: Arc<dyn Transport>,
  tokens: Arc<dyn TokenProvider>,
  connectivity: Arc<dyn Connectivity>,
  cache: ResponseCache,
  queue: MutationQueue,
  dedup: Deduplicator,
  retry: RetryPolicy,
  replaying: AtomicBool,
}

/// Snapshot of client state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
  pub online: bool,
  pub pending: usize,
  pub in_flight: usize,
}

/// Builder for [`SyncClient`]. Stores default to in-memory ones.
pub struct SyncClientBuilder {
  transport: Arc<dyn Transport>,
  tokens: Arc<dyn TokenProvider>,
  connectivity: Arc<dyn Connectivity>,
  cache_store: Arc<dyn KeyValueStore>,
  queue_store: Arc<dyn KeyValueStore>,
  key_scope: KeyScope,
  retry: RetryPolicy,
  dedup_window: Duration,
  dedup_grace: Duration,
}

impl SyncClientBuilder {
  pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
    self.connectivity = connectivity;
    self
  }

  pub fn cache_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.cache_store = store;
    self
  }

  pub fn queue_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.queue_store = store;
    self
  }

  pub fn key_scope(mut self, scope: KeyScope) -> Self {
    self.key_scope = scope;
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Window within which identical calls are joined, and how long a settled
  /// call stays joinable.
  pub fn dedup(mut self, window: Duration, grace: Duration) -> Self {
    self.dedup_window = window;
    self.dedup_grace = grace;
    self
  }

  /// Build the client and load any persisted mutation queue.
  pub fn build(self) -> SyncClient {
    let client = SyncClient {
      inner: Arc::new(Inner {
        transport: self.transport,
        tokens: self.tokens,
        connectivity: self.connectivity,
        cache: ResponseCache::new(self.cache_store).with_scope(self.key_scope),
        queue: MutationQueue::new(self.queue_store),
        dedup: Deduplicator::new(self.dedup_window, self.dedup_grace),
        retry: self.retry,
        replaying: AtomicBool::new(false),
      }),
    };
    client.load_pending();
    client
  }
}

impl SyncClient {
  pub fn builder(transport: Arc<dyn Transport>, tokens: Arc<dyn TokenProvider>) -> SyncClientBuilder {
    SyncClientBuilder {
      transport,
      tokens,
      connectivity: Arc::new(ConnectivityMonitor::default()),
      cache_store: Arc::new(MemoryStore::new()),
      queue_store: Arc::new(MemoryStore::new()),
      key_scope: KeyScope::default(),
      retry: RetryPolicy::default(),
      dedup_window: Duration::from_secs(30),
      dedup_grace: Duration::from_millis(100),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.connectivity.is_online()
  }

  pub fn status(&self) -> SyncStatus {
    SyncStatus {
      online: self.is_online(),
      pending: self.inner.queue.len(),
      in_flight: self.inner.dedup.in_flight(),
    }
  }

  // ==========================================================================
  // Read path
  // ==========================================================================

  /// Read `resource` according to `policy`.
  ///
  /// 1. Return the cached entry if the policy accepts it
  /// 2. Otherwise fetch from network (deduplicated, retried)
  /// 3. Store fresh data in the cache
  /// 4. On failure, serve the last cached value (offline mode)
  pub async fn fetch(&self, resource: &str, policy: ReadPolicy) -> ApiResponse {
    let key = self.inner.cache.key_for(resource);

    let cached = match policy {
      ReadPolicy::NetworkFirst => None,
      ReadPolicy::CacheFirst | ReadPolicy::Fresh(_) => self.inner.cache.get(&key),
    };

    if let Some(entry) = &cached {
      let sufficient = !entry.stale
        && match policy {
          ReadPolicy::CacheFirst => true,
          ReadPolicy::Fresh(max_age) => !entry.is_older_than(max_age),
          ReadPolicy::NetworkFirst => false,
        };
      if sufficient {
        debug!("Serving {} from cache", resource);
        return ApiResponse::cached(entry.payload.clone(), entry.cached_at);
      }
    }

    let result = if self.is_online() {
      self.execute_remote(RemoteRequest::read(resource)).await
    } else {
      Err(SyncError::Offline)
    };

    match result {
      Ok(payload) => {
        self.inner.cache.put(&key, &payload);
        ApiResponse::network(payload)
      }
      Err(err) => match cached.or_else(|| self.inner.cache.get(&key)) {
        Some(entry) => {
          info!("Serving cached {} after failed read: {}", resource, err);
          ApiResponse::offline(entry.payload, entry.cached_at, err)
        }
        None => {
          warn!("Read of {} failed with nothing cached: {}", resource, err);
          ApiResponse::failure(err)
        }
      },
    }
  }

  /// Read several resources concurrently. Each entry follows [`fetch`](Self::fetch).
  pub async fn fetch_many<I, S>(&self, resources: I, policy: ReadPolicy) -> HashMap<String, ApiResponse>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let reads = resources.into_iter().map(|resource| {
      let resource: String = resource.into();
      async move {
        let response = self.fetch(&resource, policy).await;
        (resource, response)
      }
    });

    futures::future::join_all(reads).await.into_iter().collect()
  }

  /// Warm the cache for `resource` in the background.
  pub fn prefetch(&self, resource: &str) -> JoinHandle<()> {
    let client = self.clone();
    let resource = resource.to_string();

    tokio::spawn(async move {
      let response = client.fetch(&resource, ReadPolicy::NetworkFirst).await;
      if response.source != DataSource::Network {
        debug!(
          "Prefetch of {} did not reach the network: {:?}",
          resource, response.error
        );
      }
    })
  }

  pub fn is_cached(&self, resource: &str) -> bool {
    let key = self.inner.cache.key_for(resource);
    self.inner.cache.contains(&key)
  }

  /// Force the next read of `resource` to the network. The cached entry is
  /// still served if that read fails.
  pub fn invalidate(&self, resource: &str) {
    let key = self.inner.cache.key_for(resource);
    self.inner.cache.invalidate(&key);
  }

  /// The cached entry for `resource`, without touching the network.
  pub fn cached(&self, resource: &str) -> Option<CachedEntry> {
    let key = self.inner.cache.key_for(resource);
    self.inner.cache.get(&key)
  }

  // ==========================================================================
  // Write path
  // ==========================================================================

  pub async fn append(&self, resource: &str, rows: Rows) -> ApiResponse {
    self
      .submit(RemoteRequest::append(resource, normalize_rows(rows)))
      .await
  }

  pub async fn update(&self, resource: &str, rows: Rows) -> ApiResponse {
    self
      .submit(RemoteRequest::update(resource, normalize_rows(rows)))
      .await
  }

  pub async fn clear(&self, resource: &str) -> ApiResponse {
    self.submit(RemoteRequest::clear(resource)).await
  }

  /// Execute a mutation, or queue it when offline.
  async fn submit(&self, request: RemoteRequest) -> ApiResponse {
    if let Err(err) = validate(&request) {
      warn!("Rejected {} of {:?}: {}", request.verb, request.resource, err);
      return ApiResponse::failure(err);
    }

    if !self.is_online() {
      let (mutation, durable) = self.inner.queue.enqueue(request);
      if !durable {
        warn!(
          "Mutation {} is held in memory only and will be lost on exit",
          mutation.id
        );
      }
      self.inner.cache.apply_write(&mutation.request);
      return ApiResponse::queued();
    }

    match self.execute_remote(request.clone()).await {
      Ok(ack) => {
        self.inner.cache.apply_write(&request);
        ApiResponse::network(ack)
      }
      Err(err) => {
        warn!("{} of {} failed: {}", request.verb, request.resource, err);
        ApiResponse::failure(err)
      }
    }
  }

  // ==========================================================================
  // Mutation queue
  // ==========================================================================

  /// Replay queued mutations oldest first.
  ///
  /// Successful mutations leave durable storage; failed ones stay queued for
  /// the next call. Replay is at-least-once: a write the remote applied but
  /// whose local removal failed is sent again.
  pub async fn replay_pending(&self) -> ReplayReport {
    let mut report = ReplayReport::default();

    if !self.is_online() {
      return report;
    }
    let Some(_guard) = ReplayGuard::acquire(&self.inner.replaying) else {
      debug!("Replay already running");
      return report;
    };

    let snapshot = self.inner.queue.take_snapshot();
    if snapshot.is_empty() {
      return report;
    }
    info!("Processing {} pending mutations...", snapshot.len());

    let mut remaining = snapshot.into_iter();
    while let Some(mutation) = remaining.next() {
      if !self.is_online() {
        report.deferred = 1 + remaining.len();
        self.inner.queue.requeue(mutation);
        remaining.by_ref().for_each(|m| self.inner.queue.requeue(m));
        break;
      }

      report.attempted += 1;
      match self.execute_remote(mutation.request.clone()).await {
        Ok(_) => {
          self.inner.queue.complete(&mutation.id);
          report.succeeded += 1;
        }
        Err(err) => {
          warn!("Failed to replay mutation {}: {}", mutation.id, err);
          self.inner.queue.requeue(mutation);
          report.failed += 1;
        }
      }
    }

    info!(
      "Finished processing mutations, remaining: {}",
      self.inner.queue.len()
    );
    report
  }

  pub fn pending_mutations(&self) -> Vec<PendingMutation> {
    self.inner.queue.pending()
  }

  /// Mutations currently in durable storage.
  pub fn persisted_mutations(&self) -> Vec<PendingMutation> {
    self.inner.queue.persisted()
  }

  /// Pick up mutations another process persisted since this client was built.
  /// Already known ones are skipped. Returns how many were added.
  pub fn load_pending(&self) -> usize {
    self.inner.queue.load()
  }

  /// Drop a queued mutation without replaying it.
  pub fn discard_mutation(&self, id: &str) -> bool {
    self.inner.queue.discard(id)
  }

  /// Replay the queue now if online and non-empty, then again on every
  /// offline to online transition. Abort the handle to stop watching.
  pub fn spawn_replay_on_reconnect(&self) -> JoinHandle<()> {
    let client = self.clone();
    let mut rx = self.inner.connectivity.subscribe();

    tokio::spawn(async move {
      let online = *rx.borrow_and_update();
      if online && !client.inner.queue.is_empty() {
        client.replay_pending().await;
      }

      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online {
          client.replay_pending().await;
        }
      }
    })
  }

  // ==========================================================================
  // Remote calls
  // ==========================================================================

  /// Deduplicated, retried, auth-refreshing remote call.
  async fn execute_remote(&self, request: RemoteRequest) -> Result<Value, SyncError> {
    let request_id = request.request_id();
    let inner = Arc::clone(&self.inner);

    self
      .inner
      .dedup
      .run(&request_id, move || {
        async move { inner.call_with_auth(&request).await }.boxed()
      })
      .await
  }
}

impl Inner {
  /// One credential refresh and one more round of retries after an auth
  /// failure; never a refresh per attempt.
  async fn call_with_auth(&self, request: &RemoteRequest) -> Result<Value, SyncError> {
    let token = self.tokens.access_token().await?;

    match self.call_with_retry(request, &token).await {
      Err(err) if err.is_auth() => {
        info!(
          "Credential rejected for {} {}, refreshing",
          request.verb, request.resource
        );
        let token = self.tokens.refresh_access_token().await?;
        self.call_with_retry(request, &token).await
      }
      other => other,
    }
  }

  async fn call_with_retry(&self, request: &RemoteRequest, token: &AccessToken) -> Result<Value, SyncError> {
    let label = format!("{} {}", request.verb, request.resource);

    self
      .retry
      .run(&label, |_| async move {
        self
          .transport
          .execute(request, token)
          .await
          .map_err(SyncError::from)
      })
      .await
  }
}

fn validate(request: &RemoteRequest) -> Result<(), SyncError> {
  if request.resource.trim().is_empty() {
    return Err(SyncError::InvalidInput("resource must not be empty".into()));
  }

  if matches!(request.verb, Verb::Append | Verb::Update) {
    let has_rows = request.rows().map(|rows| !rows.is_empty()).unwrap_or(false);
    if !has_rows {
      return Err(SyncError::InvalidInput(format!(
        "{} requires at least one row",
        request.verb
      )));
    }
  }

  Ok(())
}

/// Clears the replay flag when a replay pass ends, however it ends.
struct ReplayGuard<'a>(&'a AtomicBool);

impl<'a> ReplayGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for ReplayGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::StaticToken;
  use crate::sync::RemoteError;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::sync::Mutex;

  /// Transport that answers reads with fixed rows and records every call.
  #[derive(Default)]
  struct RecordingTransport {
    calls: Mutex<Vec<RemoteRequest>>,
    auth_failures: AtomicU32,
  }

  #[async_trait]
  impl Transport for RecordingTransport {
    async fn execute(&self, request: &RemoteRequest, token: &AccessToken) -> Result<Value, RemoteError> {
      self.calls.lock().unwrap().push(request.clone());
      if token.as_str() == "stale" {
        self.auth_failures.fetch_add(1, Ordering::SeqCst);
        return Err(RemoteError::Unauthorized {
          status: 401,
          message: "expired".into(),
        });
      }
      Ok(match request.verb {
        Verb::Read => json!([["a", "1"]]),
        _ => json!({"updatedRows": 1}),
      })
    }
  }

  /// Hands out "stale" until refreshed.
  #[derive(Default)]
  struct RotatingToken {
    refreshed: AtomicBool,
    refreshes: AtomicU32,
  }

  #[async_trait]
  impl TokenProvider for RotatingToken {
    async fn access_token(&self) -> Result<AccessToken, RemoteError> {
      Ok(AccessToken(
        if self.refreshed.load(Ordering::SeqCst) { "fresh" } else { "stale" }.to_string(),
      ))
    }

    async fn refresh_access_token(&self) -> Result<AccessToken, RemoteError> {
      self.refreshes.fetch_add(1, Ordering::SeqCst);
      self.refreshed.store(true, Ordering::SeqCst);
      Ok(AccessToken("fresh".into()))
    }
  }

  fn fast_retry() -> RetryPolicy {
    RetryPolicy {
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(2),
      ..RetryPolicy::default()
    }
  }

  fn client(transport: Arc<RecordingTransport>) -> SyncClient {
    SyncClient::builder(transport, Arc::new(StaticToken::new("token")))
      .retry(fast_retry())
      .dedup(Duration::from_secs(30), Duration::ZERO)
      .build()
  }

  #[tokio::test]
  async fn test_cache_first_skips_network_on_hit() {
    let transport = Arc::new(RecordingTransport::default());
    let client = client(transport.clone());

    let first = client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    assert_eq!(first.source, DataSource::Network);

    let second = client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    assert_eq!(second.source, DataSource::Cache);
    assert!(second.from_cache());
    assert_eq!(second.data, Some(json!([["a", "1"]])));
    assert_eq!(transport.calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_network_first_and_fresh_policies_refetch() {
    let transport = Arc::new(RecordingTransport::default());
    let client = client(transport.clone());

    client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    let refreshed = client.fetch("Sheet1!A2:B", ReadPolicy::NetworkFirst).await;
    assert_eq!(refreshed.source, DataSource::Network);

    let fresh = client
      .fetch("Sheet1!A2:B", ReadPolicy::Fresh(Duration::from_secs(300)))
      .await;
    assert_eq!(fresh.source, DataSource::Cache);

    let expired = client
      .fetch("Sheet1!A2:B", ReadPolicy::Fresh(Duration::ZERO))
      .await;
    assert_eq!(expired.source, DataSource::Network);
    assert_eq!(transport.calls.lock().unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch_but_keeps_fallback() {
    let transport = Arc::new(RecordingTransport::default());
    let monitor = ConnectivityMonitor::new(true);
    let client = SyncClient::builder(transport.clone(), Arc::new(StaticToken::new("token")))
      .connectivity(Arc::new(monitor.clone()))
      .retry(fast_retry())
      .dedup(Duration::from_secs(30), Duration::ZERO)
      .build();

    client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    client.invalidate("Sheet1!A2:B");
    assert!(client.is_cached("Sheet1!A2:B"));

    let refetched = client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    assert_eq!(refetched.source, DataSource::Network);
    assert_eq!(transport.calls.lock().unwrap().len(), 2);

    // Fresh again after the refetch
    let hit = client
      .fetch("Sheet1!A2:B", ReadPolicy::Fresh(Duration::from_secs(300)))
      .await;
    assert_eq!(hit.source, DataSource::Cache);

    client.invalidate("Sheet1!A2:B");
    monitor.set_online(false);
    let fallback = client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    assert_eq!(fallback.source, DataSource::Offline);
    assert_eq!(fallback.data, Some(json!([["a", "1"]])));
    assert_eq!(transport.calls.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_offline_read_without_cache_fails() {
    let transport = Arc::new(RecordingTransport::default());
    let monitor = ConnectivityMonitor::new(false);
    let client = SyncClient::builder(transport.clone(), Arc::new(StaticToken::new("token")))
      .connectivity(Arc::new(monitor))
      .build();

    let response = client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;

    assert!(!response.success);
    assert_eq!(response.error, Some(SyncError::Offline));
    assert_eq!(response.source, DataSource::Offline);
    assert!(!response.from_cache());
    assert!(transport.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_auth_failure_refreshes_once_and_retries() {
    let transport = Arc::new(RecordingTransport::default());
    let tokens = Arc::new(RotatingToken::default());
    let client = SyncClient::builder(transport.clone(), tokens.clone())
      .retry(fast_retry())
      .build();

    let response = client.fetch("Sheet1!A2:B", ReadPolicy::NetworkFirst).await;

    assert!(response.success);
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    // One rejected attempt, not one per retry
    assert_eq!(transport.auth_failures.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_invalid_writes_are_rejected_locally() {
    let transport = Arc::new(RecordingTransport::default());
    let client = client(transport.clone());

    let empty_rows = client.append("Sheet1!A2:B", Vec::new()).await;
    let empty_resource = client.clear("  ").await;

    assert!(matches!(empty_rows.error, Some(SyncError::InvalidInput(_))));
    assert!(matches!(empty_resource.error, Some(SyncError::InvalidInput(_))));
    assert!(transport.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_online_write_normalizes_and_patches_cache() {
    let transport = Arc::new(RecordingTransport::default());
    let client = client(transport.clone());

    client.fetch("Sheet1!A2:B", ReadPolicy::CacheFirst).await;
    let response = client
      .append("Sheet1!A2:B", vec![vec![json!("b"), json!(2)]])
      .await;

    assert!(response.success);
    assert_eq!(response.source, DataSource::Network);
    assert_eq!(
      client.cached("Sheet1!A2:B").unwrap().payload,
      json!([["a", "1"], ["b", "2"]])
    );

    let calls = transport.calls.lock().unwrap();
    assert_eq!(calls[1].rows(), Some(vec![vec![json!("b"), json!("2")]]));
  }

  #[tokio::test]
  async fn test_discard_pending_mutation() {
    let transport = Arc::new(RecordingTransport::default());
    let monitor = ConnectivityMonitor::new(false);
    let client = SyncClient::builder(transport.clone(), Arc::new(StaticToken::new("token")))
      .connectivity(Arc::new(monitor.clone()))
      .build();

    client.clear("Todos!A5:D5").await;
    let id = client.pending_mutations()[0].id.clone();
    assert!(client.discard_mutation(&id));

    monitor.set_online(true);
    let report = client.replay_pending().await;
    assert_eq!(report.attempted, 0);
    assert!(transport.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_status_reports_queue() {
    let transport = Arc::new(RecordingTransport::default());
    let client = SyncClient::builder(transport, Arc::new(StaticToken::new("token")))
      .connectivity(Arc::new(ConnectivityMonitor::new(false)))
      .build();

    client.clear("Todos!A5:D5").await;
    let status = client.status();
    assert!(!status.online);
    assert_eq!(status.pending, 1);
  }
}
