//! Offline-tolerant client for a remote spreadsheet-style row store.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod logging;
pub mod remote;
pub mod storage;
pub mod sync;

use color_eyre::Result;
use std::sync::Arc;

use config::Config;
use connectivity::Connectivity;
use remote::{EnvToken, HttpTransport, TokenProvider};
use storage::{KeyValueStore, NoopStore, SqliteDatabase};

pub use sync::{ApiResponse, DataSource, ReadPolicy, SyncClient, SyncError};

/// Build a client backed by the configured SQLite database and HTTP remote.
pub fn open_client(config: &Config, connectivity: Arc<dyn Connectivity>) -> Result<SyncClient> {
  let db = SqliteDatabase::open(&config.database_path()?)?;
  let transport = HttpTransport::new(&config.remote.base_url, &config.remote.value_input_option)?;
  let tokens: Arc<dyn TokenProvider> = Arc::new(EnvToken::new());

  let cache_store: Arc<dyn KeyValueStore> = if config.cache.enabled {
    Arc::new(db.namespace("cache"))
  } else {
    Arc::new(NoopStore)
  };

  Ok(
    SyncClient::builder(Arc::new(transport), tokens)
      .connectivity(connectivity)
      .cache_store(cache_store)
      .queue_store(Arc::new(db.namespace("mutations")))
      .key_scope(config.key_scope())
      .retry(config.retry_policy())
      .dedup(config.dedup_window(), config.dedup_grace())
      .build(),
  )
}
