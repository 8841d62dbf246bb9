//! Durable FIFO of mutations waiting to be replayed against the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use super::storage::KeyValueStore;
use crate::vehicle::{Vehicle, VehiclePatch};

/// Storage key holding the serialized queue.
pub const PENDING_KEY: &str = "pending_actions";

/// A mutation recorded while the remote store could not take it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingMutation {
  /// Entry registered offline. Carries the full snapshot, local id included.
  Add {
    vehicle: Vehicle,
    issued_at: DateTime<Utc>,
  },
  /// Fields changed offline, plus the snapshot they produced locally.
  Update {
    id: String,
    patch: VehiclePatch,
    snapshot: Vehicle,
    issued_at: DateTime<Utc>,
  },
  /// Removal of a record that already lives in the remote store.
  Delete { id: String, issued_at: DateTime<Utc> },
}

impl PendingMutation {
  pub fn add(vehicle: Vehicle) -> Self {
    PendingMutation::Add {
      vehicle,
      issued_at: Utc::now(),
    }
  }

  pub fn update(id: impl Into<String>, patch: VehiclePatch, snapshot: Vehicle) -> Self {
    PendingMutation::Update {
      id: id.into(),
      patch,
      snapshot,
      issued_at: Utc::now(),
    }
  }

  pub fn delete(id: impl Into<String>) -> Self {
    PendingMutation::Delete {
      id: id.into(),
      issued_at: Utc::now(),
    }
  }

  /// Identifier of the vehicle this mutation targets.
  pub fn target_id(&self) -> Option<&str> {
    match self {
      PendingMutation::Add { vehicle, .. } => vehicle.id(),
      PendingMutation::Update { id, .. } | PendingMutation::Delete { id, .. } => Some(id),
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      PendingMutation::Add { .. } => "add",
      PendingMutation::Update { .. } => "update",
      PendingMutation::Delete { .. } => "delete",
    }
  }
}

/// Pending mutation log.
///
/// Mutations are only ever removed all at once with [`PendingLog::clear`].
#[derive(Clone)]
pub struct PendingLog {
  storage: Arc<dyn KeyValueStore>,
  write_lock: Arc<Mutex<()>>,
}

impl PendingLog {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      storage,
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  /// Add a mutation at the tail. Persisted before returning.
  pub fn append(&self, mutation: PendingMutation) {
    let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut mutations = self.drain();
    mutations.push(mutation);

    match serde_json::to_string(&mutations) {
      Ok(json) => self.storage.set_item(PENDING_KEY, &json),
      Err(e) => warn!(error = %e, "Failed to serialize pending mutations"),
    }
  }

  /// Every queued mutation in issuance order. Does not remove anything.
  pub fn drain(&self) -> Vec<PendingMutation> {
    let Some(raw) = self.storage.get_item(PENDING_KEY) else {
      return Vec::new();
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
      warn!(error = %e, "Pending mutation log is unreadable, treating as empty");
      Vec::new()
    })
  }

  pub fn clear(&self) {
    let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    self.storage.remove_item(PENDING_KEY);
  }

  pub fn len(&self) -> usize {
    self.drain().len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
