//! Error taxonomy for remote and local sync failures.

use std::time::Duration;
use thiserror::Error;

/// Failure returned inside an [`ApiResponse`](super::ApiResponse).
///
/// `Clone` because a deduplicated call fans the same outcome out to every
/// joining caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Network unavailable and nothing cached to fall back on
  #[error("offline and no cached data available")]
  Offline,

  /// Credential rejected by the remote store
  #[error("authentication failed: {0}")]
  Auth(String),

  /// Non-2xx response that is not an authentication failure
  #[error("request failed with status {status}: {message}")]
  Status { status: u16, message: String },

  /// Request could not be sent or the connection dropped
  #[error("network error: {0}")]
  Network(String),

  /// A single attempt exceeded its time budget
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Caller supplied something the remote would reject anyway
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Local durable storage failed
  #[error("storage error: {0}")]
  Storage(String),

  /// Response body could not be decoded
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl SyncError {
  /// Whether the backoff loop should try again after this error.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::Status { .. } | Self::Network(_) | Self::Timeout(_)
    )
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Auth(_))
  }
}

/// Error reported by a [`Transport`](crate::remote::Transport) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  #[error("unauthorized ({status}): {message}")]
  Unauthorized { status: u16, message: String },

  #[error("status {status}: {message}")]
  Status { status: u16, message: String },

  #[error("{0}")]
  Network(String),

  #[error("{0}")]
  Decode(String),
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Unauthorized { status, message } => {
        SyncError::Auth(format!("{} ({})", message, status))
      }
      RemoteError::Status { status, message } => SyncError::Status { status, message },
      RemoteError::Network(msg) => SyncError::Network(msg),
      RemoteError::Decode(msg) => SyncError::Decode(msg),
    }
  }
}
