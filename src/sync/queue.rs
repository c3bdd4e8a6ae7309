//! Durable queue of writes recorded while offline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::types::{PendingMutation, RemoteRequest};
use crate::storage::KeyValueStore;

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  pub attempted: usize,
  pub succeeded: usize,
  /// Kept for the next online transition
  pub failed: usize,
  /// Not attempted because connectivity dropped mid-replay
  pub deferred: usize,
}

/// Live pending list mirrored into a durable store.
///
/// A mutation leaves the durable store only through [`complete`](Self::complete)
/// or [`discard`](Self::discard).
pub struct MutationQueue {
  live: Mutex<Vec<PendingMutation>>,
  store: Arc<dyn KeyValueStore>,
  sequence: AtomicU64,
}

impl MutationQueue {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      live: Mutex::new(Vec::new()),
      store,
      sequence: AtomicU64::new(0),
    }
  }

  fn live(&self) -> MutexGuard<'_, Vec<PendingMutation>> {
    self.live.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Pull persisted mutations into the live list. Returns how many were added.
  pub fn load(&self) -> usize {
    let persisted = self.persisted();
    let mut live = self.live();
    let mut loaded = 0;

    for mutation in persisted {
      if live.iter().all(|m| m.id != mutation.id) {
        live.push(mutation);
        loaded += 1;
      }
    }

    if loaded > 0 {
      info!("Loaded {} pending mutations from storage", loaded);
    }
    loaded
  }

  /// Everything currently in durable storage, in write order.
  pub fn persisted(&self) -> Vec<PendingMutation> {
    let entries = match self.store.get_all() {
      Ok(entries) => entries,
      Err(e) => {
        warn!("Failed to read pending mutations: {}", e);
        return Vec::new();
      }
    };

    entries
      .into_iter()
      .filter_map(|(key, value)| match serde_json::from_slice(&value.data) {
        Ok(mutation) => Some(mutation),
        Err(e) => {
          warn!("Skipping unreadable pending mutation {}: {}", key, e);
          None
        }
      })
      .collect()
  }

  /// Record `request` for replay. The mutation stays in memory even when
  /// persisting it fails; the returned flag says whether it is durable.
  pub fn enqueue(&self, request: RemoteRequest) -> (PendingMutation, bool) {
    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
    let mutation = PendingMutation::new(request, sequence);

    let durable = match serde_json::to_vec(&mutation) {
      Ok(data) => match self.store.put(&mutation.id, &data) {
        Ok(()) => true,
        Err(e) => {
          warn!("Failed to store pending mutation {}: {}", mutation.id, e);
          false
        }
      },
      Err(e) => {
        warn!("Failed to serialize pending mutation {}: {}", mutation.id, e);
        false
      }
    };

    info!("Queued offline mutation {}", mutation.id);
    self.live().push(mutation.clone());
    (mutation, durable)
  }

  /// Take every live mutation, oldest first, leaving the live list empty.
  pub fn take_snapshot(&self) -> Vec<PendingMutation> {
    let mut snapshot = std::mem::take(&mut *self.live());
    snapshot.sort_by_key(|m| (m.timestamp, m.sequence));
    snapshot
  }

  /// Put a mutation back for the next replay.
  pub fn requeue(&self, mutation: PendingMutation) {
    self.live().push(mutation);
  }

  /// Forget a mutation that was replayed successfully.
  pub fn complete(&self, id: &str) {
    if let Err(e) = self.store.delete(id) {
      warn!("Failed to remove replayed mutation {}: {}", id, e);
    } else {
      debug!("Removed replayed mutation {}", id);
    }
  }

  /// Drop a queued mutation without replaying it. Returns whether it was known.
  pub fn discard(&self, id: &str) -> bool {
    let was_live = {
      let mut live = self.live();
      let before = live.len();
      live.retain(|m| m.id != id);
      live.len() != before
    };

    let was_persisted = matches!(self.store.get(id), Ok(Some(_)));
    if let Err(e) = self.store.delete(id) {
      warn!("Failed to discard mutation {}: {}", id, e);
    }

    if was_live || was_persisted {
      info!("Discarded pending mutation {}", id);
    }
    was_live || was_persisted
  }

  pub fn pending(&self) -> Vec<PendingMutation> {
    self.live().clone()
  }

  pub fn len(&self) -> usize {
    self.live().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
