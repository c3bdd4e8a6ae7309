//! Retry with capped, jittered exponential backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::error::SyncError;

/// Bounds for retrying a single remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Retries after the initial attempt
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Inclusive range the computed delay is scaled by
  pub jitter: (f64, f64),
  /// Time budget for each attempt; `None` leaves it to the transport
  pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(300),
      max_delay: Duration::from_secs(10),
      jitter: (0.85, 1.15),
      attempt_timeout: Some(Duration::from_secs(15)),
    }
  }
}

impl RetryPolicy {
  pub fn max_attempts(&self) -> u32 {
    self.max_retries.saturating_add(1)
  }

  /// Delay before retry `retry` (1-based) for a given jitter factor.
  pub fn delay_for(&self, retry: u32, jitter: f64) -> Duration {
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent) * jitter;
    Duration::from_secs_f64(secs.clamp(0.0, self.max_delay.as_secs_f64()))
  }

  fn jittered_delay(&self, retry: u32) -> Duration {
    let (lo, hi) = self.jitter;
    let factor = if hi > lo {
      rand::thread_rng().gen_range(lo..=hi)
    } else {
      lo
    };
    self.delay_for(retry, factor)
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// attempt bound is reached. The closure receives the 1-based attempt number.
  pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, SyncError>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let max_attempts = self.max_attempts();
    let mut attempt = 1;

    loop {
      let result = match self.attempt_timeout {
        Some(limit) => tokio::time::timeout(limit, op(attempt))
          .await
          .unwrap_or(Err(SyncError::Timeout(limit))),
        None => op(attempt).await,
      };

      let err = match result {
        Ok(value) => return Ok(value),
        Err(err) => err,
      };

      if !err.is_retryable() || attempt >= max_attempts {
        return Err(err);
      }

      let delay = self.jittered_delay(attempt);
      warn!(
        "{} failed (attempt {}/{}): {}, retrying in {}ms",
        label,
        attempt,
        max_attempts,
        err,
        delay.as_millis()
      );
      tokio::time::sleep(delay).await;
      attempt += 1;
    }
  }
}
