//! Core types for the response cache.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A cached payload for one logical resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
  pub key: String,
  pub payload: Value,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
  /// Invalidated; only good as a fallback
  pub stale: bool,
}

impl CachedEntry {
  /// Whether the entry is older than `max_age`.
  pub fn is_older_than(&self, max_age: std::time::Duration) -> bool {
    match chrono::Duration::from_std(max_age) {
      Ok(max_age) => Utc::now() - self.cached_at > max_age,
      // Ages beyond chrono's range are never exceeded
      Err(_) => false,
    }
  }
}

/// How resource ids map onto cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyScope {
  /// One entry per distinct resource id
  #[default]
  Exact,
  /// One entry per collection: the lowercased text before `separator`
  Collection { separator: char },
}

impl KeyScope {
  pub fn key_for(&self, resource: &str) -> String {
    let resource = resource.trim();
    match self {
      KeyScope::Exact => resource.to_string(),
      KeyScope::Collection { separator } => resource
        .split(*separator)
        .next()
        .unwrap_or(resource)
        .to_lowercase(),
    }
  }

  pub fn is_exact(&self) -> bool {
    matches!(self, KeyScope::Exact)
  }
}
