//! Scriptable in-memory remote store for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{Created, RemoteError, RemoteResult, RemoteStore, SnapshotReceiver};
use crate::vehicle::{Vehicle, VehiclePatch};

#[derive(Default)]
struct State {
  docs: Vec<Vehicle>,
  next_id: u64,
  clock: i64,
  calls: Vec<String>,
  /// Errors returned by the next `create` calls, in order
  create_failures: VecDeque<RemoteError>,
  /// Plates whose creation always fails
  rejected_plates: HashSet<String>,
  update_failure: Option<RemoteError>,
  watch_failure: Option<RemoteError>,
  watchers: Vec<mpsc::UnboundedSender<RemoteResult<Vec<Vehicle>>>>,
}

impl State {
  fn snapshot(&self) -> Vec<Vehicle> {
    let mut docs = self.docs.clone();
    docs.sort_by_key(|v| std::cmp::Reverse(v.ordering_key()));
    docs
  }

  fn notify(&mut self) {
    let snapshot = self.snapshot();
    self
      .watchers
      .retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
  }
}

/// In-memory remote store recording every call it receives.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  /// Every operation received, formatted as `op:arg`.
  pub fn calls(&self) -> Vec<String> {
    self.state().calls.clone()
  }

  pub fn docs(&self) -> Vec<Vehicle> {
    self.state().snapshot()
  }

  pub fn insert(&self, vehicle: Vehicle) {
    let mut state = self.state();
    state.docs.push(vehicle);
    state.notify();
  }

  pub fn fail_next_create(&self, error: RemoteError) {
    self.state().create_failures.push_back(error);
  }

  pub fn reject_plate(&self, plate: &str) {
    self.state().rejected_plates.insert(plate.to_string());
  }

  pub fn accept_all_plates(&self) {
    self.state().rejected_plates.clear();
  }

  pub fn fail_updates(&self, error: RemoteError) {
    self.state().update_failure = Some(error);
  }

  pub fn restore_updates(&self) {
    self.state().update_failure = None;
  }

  pub fn fail_watch(&self, error: RemoteError) {
    self.state().watch_failure = Some(error);
  }

  /// Push an error to every live query, as a dropped listen stream would.
  pub fn break_watchers(&self, error: RemoteError) {
    let mut state = self.state();
    for tx in state.watchers.drain(..) {
      let _ = tx.send(Err(error.clone()));
    }
  }

  fn record(&self, call: String) {
    self.state().calls.push(call);
  }
}

#[async_trait]
impl RemoteStore for MemoryStore {
  async fn create(&self, _collection: &str, vehicle: &Vehicle) -> RemoteResult<Created> {
    self.record(format!("create:{}", vehicle.plate));
    let mut state = self.state();

    if let Some(error) = state.create_failures.pop_front() {
      return Err(error);
    }
    if state.rejected_plates.contains(&vehicle.plate) {
      return Err(RemoteError::Unavailable(format!("rejected {}", vehicle.plate)));
    }

    state.next_id += 1;
    state.clock += 1;
    let created = Created {
      id: format!("remote-{}", state.next_id),
      sync_timestamp: DateTime::from_timestamp(1_700_000_000 + state.clock, 0).unwrap(),
    };
    state
      .docs
      .push(created.clone().into_vehicle(vehicle.for_remote_create()));
    state.notify();
    Ok(created)
  }

  async fn update(&self, _collection: &str, id: &str, patch: &VehiclePatch) -> RemoteResult<()> {
    self.record(format!("update:{}", id));
    let mut state = self.state();

    if let Some(error) = state.update_failure.clone() {
      return Err(error);
    }
    let doc = state
      .docs
      .iter_mut()
      .find(|v| v.id() == Some(id))
      .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
    overwrite(doc, patch);
    state.notify();
    Ok(())
  }

  async fn get(&self, _collection: &str, id: &str) -> RemoteResult<Option<Vehicle>> {
    self.record(format!("get:{}", id));
    Ok(self.state().docs.iter().find(|v| v.id() == Some(id)).cloned())
  }

  async fn delete(&self, _collection: &str, id: &str) -> RemoteResult<()> {
    self.record(format!("delete:{}", id));
    let mut state = self.state();
    let before = state.docs.len();
    state.docs.retain(|v| v.id() != Some(id));
    if state.docs.len() == before {
      return Err(RemoteError::NotFound(id.to_string()));
    }
    state.notify();
    Ok(())
  }

  async fn delete_all(&self, collection: &str) -> RemoteResult<()> {
    self.record(format!("delete_all:{}", collection));
    let mut state = self.state();
    state.docs.clear();
    state.notify();
    Ok(())
  }

  async fn query_range(
    &self,
    _collection: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> RemoteResult<Vec<Vehicle>> {
    self.record("query_range".to_string());
    Ok(
      self
        .state()
        .snapshot()
        .into_iter()
        .filter(|v| v.ordering_key() >= start && v.ordering_key() <= end)
        .collect(),
    )
  }

  fn watch(&self, collection: &str) -> SnapshotReceiver {
    self.record(format!("watch:{}", collection));
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = self.state();

    if let Some(error) = state.watch_failure.clone() {
      let _ = tx.send(Err(error));
      return rx;
    }

    let _ = tx.send(Ok(state.snapshot()));
    state.watchers.push(tx);
    rx
  }
}

/// Field-masked write with no lifecycle checks, like a document store PATCH.
fn overwrite(doc: &mut Vehicle, patch: &VehiclePatch) {
  if let Some(plate) = &patch.plate {
    doc.plate = plate.clone();
  }
  if let Some(model) = &patch.model {
    doc.model = model.clone();
  }
  if let Some(color) = &patch.color {
    doc.color = color.clone();
  }
  if let Some(owner) = &patch.owner {
    doc.owner = owner.clone();
  }
  if let Some(tag) = &patch.tag {
    doc.tag = tag.clone();
  }
  if let Some(notes) = &patch.notes {
    doc.notes = notes.clone();
  }
  if let Some(status) = patch.status {
    doc.status = status;
  }
  if let Some(exited_at) = patch.exited_at {
    doc.exited_at = Some(exited_at);
  }
}
