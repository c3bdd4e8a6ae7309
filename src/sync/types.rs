//! Request, mutation, and response types shared by the read and write paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::error::SyncError;

/// Rows of a table as sent to and received from the remote store.
pub type Rows = Vec<Vec<Value>>;

/// Header carrying the mutation id so a cooperating remote can drop replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Operation performed against a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
  Read,
  Append,
  Update,
  Clear,
}

impl Verb {
  pub fn as_str(self) -> &'static str {
    match self {
      Verb::Read => "read",
      Verb::Append => "append",
      Verb::Update => "update",
      Verb::Clear => "clear",
    }
  }
}

impl fmt::Display for Verb {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A fully-formed remote operation.
///
/// The same value is handed to the transport when online and serialized into
/// the mutation queue when offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
  pub verb: Verb,
  pub resource: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
}

impl RemoteRequest {
  pub fn read(resource: impl Into<String>) -> Self {
    Self::new(Verb::Read, resource, None)
  }

  pub fn append(resource: impl Into<String>, rows: Rows) -> Self {
    Self::new(Verb::Append, resource, Some(values_body(rows)))
  }

  pub fn update(resource: impl Into<String>, rows: Rows) -> Self {
    Self::new(Verb::Update, resource, Some(values_body(rows)))
  }

  pub fn clear(resource: impl Into<String>) -> Self {
    Self::new(Verb::Clear, resource, None)
  }

  fn new(verb: Verb, resource: impl Into<String>, body: Option<Value>) -> Self {
    let mut headers = BTreeMap::new();
    if body.is_some() {
      headers.insert("Content-Type".to_string(), "application/json".to_string());
    }
    Self {
      verb,
      resource: resource.into(),
      headers,
      body,
    }
  }

  /// Stable deduplication key over verb, resource and body.
  ///
  /// An idempotency key is folded in when present, so two queued copies of the
  /// same write never collapse into one remote call. Other headers are ignored.
  pub fn request_id(&self) -> String {
    let body = self
      .body
      .as_ref()
      .map(|b| b.to_string())
      .unwrap_or_default();
    let mut input = format!("{}:{}:{}", self.verb, self.resource, body);
    if let Some(key) = self.headers.get(IDEMPOTENCY_HEADER) {
      input.push(':');
      input.push_str(key);
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Rows carried in the body, if any.
  pub fn rows(&self) -> Option<Rows> {
    self
      .body
      .as_ref()
      .and_then(|b| b.get("values"))
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }
}

fn values_body(rows: Rows) -> Value {
  serde_json::json!({ "values": rows })
}

/// A write recorded while offline, waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub id: String,
  pub timestamp: DateTime<Utc>,
  /// Tiebreak for mutations created in the same instant
  #[serde(default)]
  pub sequence: u64,
  pub request: RemoteRequest,
}

impl PendingMutation {
  /// Record `request` for later replay. `sequence` orders and disambiguates
  /// writes created within the same millisecond.
  pub fn new(mut request: RemoteRequest, sequence: u64) -> Self {
    let timestamp = Utc::now();
    let id = format!(
      "{}:{}:{}:{}",
      request.verb,
      request.resource,
      timestamp.timestamp_millis(),
      sequence
    );
    request
      .headers
      .insert(IDEMPOTENCY_HEADER.to_string(), id.clone());

    Self {
      id,
      timestamp,
      sequence,
      request,
    }
  }
}

/// Where the data in a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
  /// Fresh data from the remote store
  Network,
  /// Cached data the read policy accepted without a network attempt
  Cache,
  /// Cached data served because the network attempt failed or was impossible.
  /// On a failed response: the client was offline and had nothing cached.
  Offline,
  /// Write accepted into the offline queue
  Queued,
}

/// Outcome of a read or write, never an `Err` across the client API.
#[derive(Debug, Clone)]
pub struct ApiResponse<T = Value> {
  pub success: bool,
  pub data: Option<T>,
  pub source: DataSource,
  /// When the served data was cached (cache-sourced responses only)
  pub cached_at: Option<DateTime<Utc>>,
  pub error: Option<SyncError>,
}

impl<T> ApiResponse<T> {
  pub fn network(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      source: DataSource::Network,
      cached_at: None,
      error: None,
    }
  }

  pub fn cached(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      success: true,
      data: Some(data),
      source: DataSource::Cache,
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Cached data served in place of a failed network call. The error that
  /// caused the fallback is kept for callers that want to surface it.
  pub fn offline(data: T, cached_at: DateTime<Utc>, cause: SyncError) -> Self {
    Self {
      success: true,
      data: Some(data),
      source: DataSource::Offline,
      cached_at: Some(cached_at),
      error: Some(cause),
    }
  }

  pub fn queued() -> Self {
    Self {
      success: true,
      data: None,
      source: DataSource::Queued,
      cached_at: None,
      error: None,
    }
  }

  /// A failed call. `source` is `Offline` when the network was never tried,
  /// `Network` otherwise.
  pub fn failure(error: SyncError) -> Self {
    let source = match error {
      SyncError::Offline => DataSource::Offline,
      _ => DataSource::Network,
    };
    Self {
      success: false,
      data: None,
      source,
      cached_at: None,
      error: Some(error),
    }
  }

  /// Whether `data` came out of the local cache.
  pub fn from_cache(&self) -> bool {
    self.data.is_some() && matches!(self.source, DataSource::Cache | DataSource::Offline)
  }
}

impl ApiResponse<Value> {
  /// Decode the payload as table rows.
  pub fn rows(&self) -> Option<Rows> {
    self
      .data
      .as_ref()
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }
}

/// How much a read trusts the cache before going to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
  /// Any cached entry is good enough
  #[default]
  CacheFirst,
  /// Accept cached entries younger than the given age
  Fresh(Duration),
  /// Always attempt the network; the cache is only a fallback
  NetworkFirst,
}

/// Normalize cell values the way the remote store expects user-entered data.
pub fn normalize_rows(rows: Rows) -> Rows {
  rows
    .into_iter()
    .map(|row| row.into_iter().map(normalize_cell).collect())
    .collect()
}

fn normalize_cell(cell: Value) -> Value {
  match cell {
    Value::Null => Value::String(String::new()),
    Value::Bool(b) => Value::String(if b { "TRUE" } else { "FALSE" }.to_string()),
    Value::Number(n) => Value::String(n.to_string()),
    Value::String(s) => Value::String(s),
    other @ (Value::Array(_) | Value::Object(_)) => Value::String(other.to_string()),
  }
}
