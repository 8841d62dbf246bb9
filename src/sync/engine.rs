use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EngineStatus, LiveFeed, ReplayPolicy, SyncReport};
use crate::cache::{KeyValueStore, LocalCache, PendingLog, PendingMutation};
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::subscription::Subscription;
use crate::vehicle::{is_local_id, mint_local_id, NewVehicle, Vehicle, VehiclePatch};

enum Replay {
  Applied,
  Skipped,
}

/// Routes vehicle mutations to the remote store when it is reachable and to
/// the local cache plus pending log when it is not.
pub struct SyncEngine<R: RemoteStore> {
  remote: Arc<R>,
  cache: LocalCache,
  pending: PendingLog,
  connectivity: Connectivity,
  collection: String,
  policy: ReplayPolicy,
}

impl<R: RemoteStore> SyncEngine<R> {
  pub fn new(
    remote: Arc<R>,
    storage: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    collection: impl Into<String>,
  ) -> Self {
    Self {
      remote,
      cache: LocalCache::new(Arc::clone(&storage)),
      pending: PendingLog::new(storage),
      connectivity,
      collection: collection.into(),
      policy: ReplayPolicy::default(),
    }
  }

  pub fn with_replay_policy(mut self, policy: ReplayPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn cache(&self) -> &LocalCache {
    &self.cache
  }

  #[cfg(test)]
  pub fn pending(&self) -> &PendingLog {
    &self.pending
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn live_feed(&self) -> LiveFeed<R> {
    LiveFeed::new(
      Arc::clone(&self.remote),
      self.cache.clone(),
      self.connectivity.clone(),
      self.collection.clone(),
    )
  }

  pub fn status(&self) -> EngineStatus {
    let cached = self.cache.load();
    EngineStatus {
      online: self.connectivity.is_online(),
      local_only: cached.iter().filter(|v| v.is_local()).count(),
      cached: cached.len(),
      pending: self.pending.len(),
    }
  }

  /// Register a vehicle entry and return its identifier.
  ///
  /// Online, the remote store assigns the identifier. Offline, or when the
  /// remote store refuses the write, the vehicle is kept under a local
  /// identifier until a sync pass migrates it.
  pub async fn add(&self, new: NewVehicle) -> SyncResult<String> {
    let vehicle = new.into_vehicle(None);

    if !self.connectivity.is_online() {
      return Ok(self.add_local(vehicle));
    }

    match self.remote.create(&self.collection, &vehicle).await {
      Ok(created) => {
        info!(id = %created.id, plate = %vehicle.plate, "Vehicle registered");
        Ok(created.id)
      }
      Err(RemoteError::PermissionDenied(msg)) => {
        warn!(reason = %msg, "Remote store refused the entry, keeping it offline");
        Ok(self.add_local(vehicle))
      }
      Err(e) => Err(e.into()),
    }
  }

  fn add_local(&self, vehicle: Vehicle) -> String {
    let id = mint_local_id();
    let vehicle = Vehicle {
      id: Some(id.clone()),
      sync_timestamp: None,
      ..vehicle
    };

    self.cache.push(vehicle.clone());
    self.pending.append(PendingMutation::add(vehicle));
    info!(%id, "Vehicle registered offline");
    id
  }

  /// Apply a partial update to a vehicle.
  ///
  /// Remote identifiers are checked for existence first; an identifier the
  /// remote store does not know is treated as an unmigrated local record.
  pub async fn update(&self, id: &str, patch: VehiclePatch) -> SyncResult<()> {
    if id.trim().is_empty() {
      return Err(SyncError::InvalidIdentifier(id.to_string()));
    }
    let patch = patch.normalized();
    patch.validate()?;

    if !self.connectivity.is_online() || is_local_id(id) {
      return self.update_local(id, patch);
    }

    let Some(mut current) = self.remote.get(&self.collection, id).await? else {
      debug!(id, "Vehicle unknown to remote store, updating cached copy");
      return self.update_local(id, patch);
    };
    current.apply(&patch)?;

    self.remote.update(&self.collection, id, &patch).await?;
    debug!(id, fields = ?patch.field_names(), "Vehicle updated");
    Ok(())
  }

  fn update_local(&self, id: &str, patch: VehiclePatch) -> SyncResult<()> {
    let snapshot = self.cache.modify(|vehicles| {
      let vehicle = vehicles
        .iter_mut()
        .find(|v| v.id() == Some(id))
        .ok_or_else(|| SyncError::NotFoundLocal(id.to_string()))?;
      vehicle.apply(&patch)?;
      Ok::<_, SyncError>(vehicle.clone())
    })?;

    self
      .pending
      .append(PendingMutation::update(id, patch, snapshot));
    debug!(id, "Vehicle updated offline");
    Ok(())
  }

  /// Delete a single vehicle record.
  ///
  /// Local records never reached the remote store, so they are only dropped
  /// from the cache. Offline deletes of remote records are queued.
  pub async fn delete(&self, id: &str) -> SyncResult<()> {
    if id.trim().is_empty() {
      return Err(SyncError::InvalidIdentifier(id.to_string()));
    }

    if is_local_id(id) || !self.connectivity.is_online() {
      if !self.cache.remove(id) {
        return Err(SyncError::NotFoundLocal(id.to_string()));
      }
      if !is_local_id(id) {
        self.pending.append(PendingMutation::delete(id));
      }
      info!(id, "Vehicle deleted locally");
      return Ok(());
    }

    self.remote.delete(&self.collection, id).await?;
    self.cache.remove(id);
    info!(id, "Vehicle deleted");
    Ok(())
  }

  /// Delete every vehicle record, remote and local.
  pub async fn delete_all(&self) -> SyncResult<()> {
    if !self.connectivity.is_online() {
      return Err(SyncError::RemoteUnavailable(
        "deleting all records requires a connection".to_string(),
      ));
    }

    self.remote.delete_all(&self.collection).await?;
    self.cache.save(&[]);
    self.pending.clear();
    info!(collection = %self.collection, "All vehicle records deleted");
    Ok(())
  }

  /// Vehicles whose ordering token falls in `[start, end]`, newest first.
  ///
  /// Answered from the cache while offline.
  pub async fn vehicles_between(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> SyncResult<Vec<Vehicle>> {
    if self.connectivity.is_online() {
      return Ok(
        self
          .remote
          .query_range(&self.collection, start, end)
          .await?,
      );
    }

    let mut vehicles: Vec<Vehicle> = self
      .cache
      .load()
      .into_iter()
      .filter(|v| v.ordering_key() >= start && v.ordering_key() <= end)
      .collect();
    vehicles.sort_by_key(|v| Reverse(v.ordering_key()));
    Ok(vehicles)
  }

  /// Replay the pending log in order, then migrate remaining local records.
  ///
  /// Does nothing while offline. Individual failures are logged and counted,
  /// never returned.
  pub async fn sync_pass(&self) -> SyncReport {
    let mut report = SyncReport::default();
    if !self.connectivity.is_online() {
      debug!("Offline, skipping sync pass");
      return report;
    }
    report.ran = true;

    let mut failed = Vec::new();
    for mutation in self.pending.drain() {
      match self.replay(&mutation).await {
        Ok(Replay::Applied) => report.replayed += 1,
        Ok(Replay::Skipped) => report.skipped += 1,
        Err(e) => {
          warn!(
            kind = mutation.kind(),
            target = mutation.target_id().unwrap_or("-"),
            error = %e,
            "Failed to replay pending mutation"
          );
          failed.push(mutation);
        }
      }
    }

    report.failed = failed.len();
    self.pending.clear();
    match self.policy {
      ReplayPolicy::RetainFailed => {
        report.retained = failed.len();
        for mutation in failed {
          self.pending.append(mutation);
        }
      }
      ReplayPolicy::DiscardOnCompletion if !failed.is_empty() => {
        warn!(count = failed.len(), "Discarding pending mutations that failed to replay");
      }
      ReplayPolicy::DiscardOnCompletion => {}
    }

    self.migrate(&mut report).await;

    info!(%report, "Sync pass finished");
    report
  }

  async fn replay(&self, mutation: &PendingMutation) -> RemoteResult<Replay> {
    match mutation {
      PendingMutation::Add { vehicle, .. } => {
        // Create from the latest cached snapshot so offline edits made
        // after the add are not lost.
        let (snapshot, local_id) = match vehicle.id() {
          Some(id) if is_local_id(id) => match self.cache.find(id) {
            Some(current) => (current, Some(id.to_string())),
            None => {
              debug!(id, "Local vehicle no longer cached, skipping add");
              return Ok(Replay::Skipped);
            }
          },
          _ => (vehicle.clone(), None),
        };

        let created = self
          .remote
          .create(&self.collection, &snapshot.for_remote_create())
          .await?;
        debug!(id = %created.id, "Replayed offline entry");
        if let Some(local_id) = local_id {
          self.cache.retire(&local_id, created.into_vehicle(snapshot));
        }
        Ok(Replay::Applied)
      }
      PendingMutation::Update { id, patch, .. } => {
        if is_local_id(id) {
          // Folded into the cached snapshot; migration carries it over.
          return Ok(Replay::Skipped);
        }
        let mut current = self
          .remote
          .get(&self.collection, id)
          .await?
          .ok_or_else(|| RemoteError::NotFound(id.clone()))?;
        current
          .apply(patch)
          .map_err(|e| RemoteError::Other(e.to_string()))?;
        self.remote.update(&self.collection, id, patch).await?;
        Ok(Replay::Applied)
      }
      PendingMutation::Delete { id, .. } => {
        if is_local_id(id) {
          return Ok(Replay::Skipped);
        }
        match self.remote.delete(&self.collection, id).await {
          Ok(()) | Err(RemoteError::NotFound(_)) => Ok(Replay::Applied),
          Err(e) => Err(e),
        }
      }
    }
  }

  async fn migrate(&self, report: &mut SyncReport) {
    for vehicle in self.cache.local_vehicles() {
      let Some(local_id) = vehicle.id.clone() else {
        continue;
      };

      match self
        .remote
        .create(&self.collection, &vehicle.for_remote_create())
        .await
      {
        Ok(created) => {
          info!(%local_id, id = %created.id, "Migrated offline vehicle");
          self.cache.retire(&local_id, created.into_vehicle(vehicle));
          report.migrated += 1;
        }
        Err(e) => {
          warn!(%local_id, error = %e, "Failed to migrate offline vehicle");
          report.migration_failed += 1;
        }
      }
    }
  }

  /// Run a sync pass every time connectivity comes back.
  ///
  /// Passes run one after another on a background task. Dropping the worker
  /// stops it.
  pub fn attach(self: &Arc<Self>) -> ReconnectWorker {
    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();
    let (report_tx, reports) = mpsc::unbounded_channel();

    let subscription = self.connectivity.on_transition(
      move || {
        let _ = trigger_tx.send(());
      },
      || debug!("Connectivity lost"),
    );

    let engine = Arc::clone(self);
    let task = tokio::spawn(async move {
      while trigger_rx.recv().await.is_some() {
        info!("Connectivity restored, synchronizing");
        let report = engine.sync_pass().await;
        let _ = report_tx.send(report);
      }
    });

    ReconnectWorker {
      _subscription: subscription,
      task,
      reports,
    }
  }
}

/// Handle to the background reconnect task started by [`SyncEngine::attach`].
pub struct ReconnectWorker {
  _subscription: Subscription,
  task: JoinHandle<()>,
  reports: mpsc::UnboundedReceiver<SyncReport>,
}

impl ReconnectWorker {
  /// Wait for the report of the next completed pass.
  pub async fn next_report(&mut self) -> Option<SyncReport> {
    self.reports.recv().await
  }
}

impl Drop for ReconnectWorker {
  fn drop(&mut self) {
    self.task.abort();
  }
}
