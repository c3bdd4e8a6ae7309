//! Ports to the remote data store and its credentials.

mod auth;
mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::sync::{RemoteError, RemoteRequest};

pub use auth::{EnvToken, StaticToken};
pub use http::HttpTransport;

/// Bearer credential attached to every remote call.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(pub String);

impl AccessToken {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Debug for AccessToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("AccessToken(***)")
  }
}

/// Executes a [`RemoteRequest`] against the backing store.
///
/// Reads return the resource payload; mutations return the store's
/// acknowledgement body.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: &RemoteRequest, token: &AccessToken) -> Result<Value, RemoteError>;
}

/// Supplies credentials. Issuing them is somebody else's job.
#[async_trait]
pub trait TokenProvider: Send + Sync {
  async fn access_token(&self) -> Result<AccessToken, RemoteError>;

  /// Obtain a new credential after the remote rejected the current one.
  async fn refresh_access_token(&self) -> Result<AccessToken, RemoteError>;
}
