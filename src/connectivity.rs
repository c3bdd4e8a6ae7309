//! Online/offline signal the sync client reacts to.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Source of truth for whether the remote is reachable.
pub trait Connectivity: Send + Sync {
  fn is_online(&self) -> bool;

  /// Receiver that observes every change of the online flag.
  fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag backed by a watch channel.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  /// Update the flag. Subscribers are only woken on an actual transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!("Connectivity changed: {}", if online { "online" } else { "offline" });
    }
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Connectivity for ConnectivityMonitor {
  fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Check once whether `url` answers at all. Any HTTP status counts as
/// reachable; only transport failures mean offline.
pub async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
  match client.head(url).timeout(timeout).send().await {
    Ok(_) => true,
    Err(e) => {
      debug!("Probe of {} failed: {}", url, e);
      false
    }
  }
}

/// Spawn a task that probes `url` every `interval` and feeds the monitor.
pub fn spawn_probe(monitor: ConnectivityMonitor, url: String, interval: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let online = probe(&client, &url, interval).await;
      monitor.set_online(online);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_only_transitions_notify() {
    let monitor = ConnectivityMonitor::new(true);
    let mut rx = monitor.subscribe();

    monitor.set_online(true);
    assert!(!rx.has_changed().unwrap());

    monitor.set_online(false);
    assert!(rx.has_changed().unwrap());
    assert!(!*rx.borrow_and_update());
    assert!(!monitor.is_online());

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }

  #[tokio::test]
  async fn test_probe_unreachable_host() {
    let client = reqwest::Client::new();
    // Port 9 on localhost is almost never listening
    let online = probe(&client, "http://127.0.0.1:9/", Duration::from_millis(500)).await;
    assert!(!online);
  }
}
