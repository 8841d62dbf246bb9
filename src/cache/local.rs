//! Durable snapshot of the known vehicle set.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use super::storage::KeyValueStore;
use crate::vehicle::Vehicle;

/// Storage key holding the serialized snapshot.
pub const VEHICLES_KEY: &str = "offline_vehicles";

/// Local cache of vehicle snapshots.
///
/// The whole set is stored under one key, so `save` replaces it in a single
/// write and `load` never sees half of an update. Read-modify-write helpers
/// serialize on an internal lock.
#[derive(Clone)]
pub struct LocalCache {
  storage: Arc<dyn KeyValueStore>,
  write_lock: Arc<Mutex<()>>,
}

impl LocalCache {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      storage,
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  /// Replace the persisted snapshot. Order is kept exactly as given.
  pub fn save(&self, vehicles: &[Vehicle]) {
    let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    self.write(vehicles);
  }

  /// Last saved snapshot, or empty when nothing (readable) is stored.
  pub fn load(&self) -> Vec<Vehicle> {
    let Some(raw) = self.storage.get_item(VEHICLES_KEY) else {
      return Vec::new();
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
      warn!(error = %e, "Cached vehicle snapshot is unreadable, starting empty");
      Vec::new()
    })
  }

  fn write(&self, vehicles: &[Vehicle]) {
    match serde_json::to_string(vehicles) {
      Ok(json) => self.storage.set_item(VEHICLES_KEY, &json),
      Err(e) => warn!(error = %e, "Failed to serialize vehicle snapshot"),
    }
  }

  /// Load, edit and save the snapshot as one step.
  ///
  /// Nothing is written when `f` returns an error.
  pub fn modify<T, E>(&self, f: impl FnOnce(&mut Vec<Vehicle>) -> Result<T, E>) -> Result<T, E> {
    let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut vehicles = self.load();
    let out = f(&mut vehicles)?;
    self.write(&vehicles);
    Ok(out)
  }

  /// `modify` for edits that cannot fail.
  fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Vehicle>) -> T) -> T {
    let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut vehicles = self.load();
    let out = f(&mut vehicles);
    self.write(&vehicles);
    out
  }

  pub fn find(&self, id: &str) -> Option<Vehicle> {
    self.load().into_iter().find(|v| v.id() == Some(id))
  }

  /// Append a vehicle to the end of the snapshot.
  pub fn push(&self, vehicle: Vehicle) {
    self.mutate(|vehicles| vehicles.push(vehicle));
  }

  /// Remove a vehicle by identifier. Returns whether it was present.
  pub fn remove(&self, id: &str) -> bool {
    self.mutate(|vehicles| {
      let before = vehicles.len();
      vehicles.retain(|v| v.id() != Some(id));
      vehicles.len() != before
    })
  }

  /// Hand a local record over to its remote replacement.
  ///
  /// The remote record takes the local one's position in a single write. If
  /// the remote record is already cached (a live snapshot got there first)
  /// the local entry is simply dropped. Returns false when the local entry
  /// is gone.
  pub fn retire(&self, local_id: &str, remote: Vehicle) -> bool {
    self.mutate(|vehicles| {
      let Some(pos) = vehicles.iter().position(|v| v.id() == Some(local_id)) else {
        return false;
      };
      let remote_cached = remote.id.is_some()
        && vehicles.iter().any(|v| v.id.is_some() && v.id == remote.id);
      if remote_cached {
        vehicles.remove(pos);
      } else {
        vehicles[pos] = remote;
      }
      true
    })
  }

  /// Persist an authoritative remote snapshot.
  ///
  /// Records still carrying a local identifier are kept after the remote set
  /// so they remain available for migration.
  pub fn persist_remote_snapshot(&self, remote: &[Vehicle]) {
    self.mutate(|vehicles| {
      let pending: Vec<Vehicle> = vehicles.drain(..).filter(Vehicle::is_local).collect();
      vehicles.extend(remote.iter().cloned());
      vehicles.extend(pending);
    });
  }

  /// Records that have not been migrated to the remote store yet.
  pub fn local_vehicles(&self) -> Vec<Vehicle> {
    self.load().into_iter().filter(Vehicle::is_local).collect()
  }
}
