//! Offline-first synchronization core.
//!
//! - `dedup`: one network call per identical in-flight request
//! - `retry`: capped, jittered exponential backoff
//! - `queue`: durable queue of writes made while offline
//! - `client`: the `SyncClient` tying these to the cache and the transport

mod client;
mod dedup;
mod error;
mod queue;
mod retry;
mod types;

pub use client::{SyncClient, SyncClientBuilder, SyncStatus};
pub use dedup::Deduplicator;
pub use error::{RemoteError, SyncError};
pub use queue::{MutationQueue, ReplayReport};
pub use retry::RetryPolicy;
pub use types::{
  normalize_rows, ApiResponse, DataSource, PendingMutation, ReadPolicy, RemoteRequest, Rows, Verb,
  IDEMPOTENCY_HEADER,
};
