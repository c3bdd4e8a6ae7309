use async_trait::async_trait;

use super::{AccessToken, TokenProvider};
use crate::sync::RemoteError;

/// A fixed credential that cannot be refreshed.
pub struct StaticToken(AccessToken);

impl StaticToken {
  pub fn new(token: impl Into<String>) -> Self {
    Self(AccessToken(token.into()))
  }
}

#[async_trait]
impl TokenProvider for StaticToken {
  async fn access_token(&self) -> Result<AccessToken, RemoteError> {
    Ok(self.0.clone())
  }

  async fn refresh_access_token(&self) -> Result<AccessToken, RemoteError> {
    Ok(self.0.clone())
  }
}

/// Reads the credential from environment variables on every call, so an
/// external helper can rotate it between attempts.
pub struct EnvToken {
  vars: Vec<String>,
}

impl EnvToken {
  /// Checks SHEETSYNC_ACCESS_TOKEN first, then GOOGLE_ACCESS_TOKEN as fallback.
  pub fn new() -> Self {
    Self::with_vars(["SHEETSYNC_ACCESS_TOKEN", "GOOGLE_ACCESS_TOKEN"])
  }

  pub fn with_vars<I, S>(vars: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      vars: vars.into_iter().map(Into::into).collect(),
    }
  }

  fn read(&self) -> Result<AccessToken, RemoteError> {
    self
      .vars
      .iter()
      .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
      .map(AccessToken)
      .ok_or_else(|| RemoteError::Unauthorized {
        status: 0,
        message: format!("access token not found. Set {}", self.vars.join(" or ")),
      })
  }
}

impl Default for EnvToken {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl TokenProvider for EnvToken {
  async fn access_token(&self) -> Result<AccessToken, RemoteError> {
    self.read()
  }

  async fn refresh_access_token(&self) -> Result<AccessToken, RemoteError> {
    self.read()
  }
}
