//! Remote document store boundary.

mod api_types;
mod firestore;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::vehicle::{Vehicle, VehiclePatch};

pub use firestore::FirestoreStore;

/// Failure classes reported by a remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("{0}")]
  Other(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Identity assigned by the remote store to a created document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
  pub id: String,
  pub sync_timestamp: DateTime<Utc>,
}

impl Created {
  /// The record as it now exists remotely.
  pub fn into_vehicle(self, mut vehicle: Vehicle) -> Vehicle {
    vehicle.id = Some(self.id);
    vehicle.sync_timestamp = Some(self.sync_timestamp);
    vehicle
  }
}

/// Full result sets pushed by a live query, newest first.
pub type SnapshotReceiver = mpsc::UnboundedReceiver<RemoteResult<Vec<Vehicle>>>;

/// Remote document store holding the authoritative vehicle collection.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
  /// Create a document. The store assigns the identifier and ordering token.
  async fn create(&self, collection: &str, vehicle: &Vehicle) -> RemoteResult<Created>;

  /// Overwrite the fields named by the patch on an existing document.
  async fn update(&self, collection: &str, id: &str, patch: &VehiclePatch) -> RemoteResult<()>;

  /// Point lookup. `None` when no document has this identifier.
  async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<Vehicle>>;

  async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()>;

  /// Delete every document in the collection.
  async fn delete_all(&self, collection: &str) -> RemoteResult<()>;

  /// Documents whose ordering token falls in `[start, end]`, newest first.
  async fn query_range(
    &self,
    collection: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> RemoteResult<Vec<Vehicle>>;

  /// Live query ordered by ordering token, newest first.
  ///
  /// Every change delivers the complete current result set. An error item
  /// ends the stream; dropping the receiver stops the query.
  fn watch(&self, collection: &str) -> SnapshotReceiver;
}
