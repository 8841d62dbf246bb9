//! Vehicle visit records and the typed partial update applied to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{SyncError, SyncResult};

/// Prefix reserved for identifiers minted while the remote store is unreachable.
pub const LOCAL_ID_PREFIX: &str = "offline_";

static LOCAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a new local identifier, unique for the lifetime of the process.
pub fn mint_local_id() -> String {
  let seq = LOCAL_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
  format!(
    "{}{}_{}",
    LOCAL_ID_PREFIX,
    Utc::now().timestamp_millis(),
    seq
  )
}

/// Whether an identifier belongs to the local namespace.
pub fn is_local_id(id: &str) -> bool {
  id.starts_with(LOCAL_ID_PREFIX)
}

/// Whether a vehicle is still parked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
  Inside,
  Exited,
}

impl VehicleStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      VehicleStatus::Inside => "INSIDE",
      VehicleStatus::Exited => "EXITED",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_uppercase().as_str() {
      "INSIDE" => Some(VehicleStatus::Inside),
      "EXITED" => Some(VehicleStatus::Exited),
      _ => None,
    }
  }
}

impl std::fmt::Display for VehicleStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A single tracked vehicle visit.
///
/// `entered_at` never changes after creation and `exited_at` is set exactly
/// once, when the visit ends. Re-entry creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub plate: String,
  #[serde(default)]
  pub model: String,
  #[serde(default)]
  pub color: String,
  #[serde(default)]
  pub owner: String,
  /// Contact number or parking tag handed to the driver
  #[serde(default)]
  pub tag: String,
  #[serde(default)]
  pub notes: String,
  pub entered_at: DateTime<Utc>,
  #[serde(default)]
  pub exited_at: Option<DateTime<Utc>>,
  pub status: VehicleStatus,
  /// Ordering token assigned by the remote store. `None` until migrated.
  #[serde(default)]
  pub sync_timestamp: Option<DateTime<Utc>>,
}

impl Vehicle {
  pub fn id(&self) -> Option<&str> {
    self.id.as_deref()
  }

  /// True when the record carries a locally-minted identifier.
  pub fn is_local(&self) -> bool {
    self.id().is_some_and(is_local_id)
  }

  pub fn is_inside(&self) -> bool {
    self.status == VehicleStatus::Inside
  }

  /// Ordering token: the server timestamp, or the entry time for local records.
  pub fn ordering_key(&self) -> DateTime<Utc> {
    self.sync_timestamp.unwrap_or(self.entered_at)
  }

  /// Copy of this record with the local-only identity stripped, ready to be
  /// created remotely.
  pub fn for_remote_create(&self) -> Vehicle {
    Vehicle {
      id: None,
      sync_timestamp: None,
      ..self.clone()
    }
  }

  /// Overlay a patch onto this snapshot.
  ///
  /// Rejects transitions the visit lifecycle forbids: reopening an exited
  /// visit and exiting twice.
  pub fn apply(&mut self, patch: &VehiclePatch) -> SyncResult<()> {
    if let Some(status) = patch.status {
      if self.status == VehicleStatus::Exited && status == VehicleStatus::Inside {
        return Err(SyncError::InvalidPatch(
          "an exited visit cannot be reopened; register a new entry instead".to_string(),
        ));
      }
    }
    if self.exited_at.is_some() && patch.exited_at.is_some() {
      return Err(SyncError::InvalidPatch(
        "exit time is already recorded".to_string(),
      ));
    }

    if let Some(plate) = &patch.plate {
      self.plate = plate.clone();
    }
    if let Some(model) = &patch.model {
      self.model = model.clone();
    }
    if let Some(color) = &patch.color {
      self.color = color.clone();
    }
    if let Some(owner) = &patch.owner {
      self.owner = owner.clone();
    }
    if let Some(tag) = &patch.tag {
      self.tag = tag.clone();
    }
    if let Some(notes) = &patch.notes {
      self.notes = notes.clone();
    }

    if let Some(status) = patch.status {
      if status == VehicleStatus::Exited && self.status == VehicleStatus::Inside {
        self.exited_at = Some(patch.exited_at.unwrap_or_else(Utc::now));
      }
      self.status = status;
    } else if let Some(exited_at) = patch.exited_at {
      self.exited_at = Some(exited_at);
      self.status = VehicleStatus::Exited;
    }

    Ok(())
  }
}

/// Fields supplied when registering an entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVehicle {
  pub plate: String,
  pub model: String,
  pub color: String,
  pub owner: String,
  pub tag: String,
  pub notes: String,
  /// Defaults to the time the entry is registered
  pub entered_at: Option<DateTime<Utc>>,
}

impl NewVehicle {
  pub fn new(plate: impl Into<String>) -> Self {
    Self {
      plate: plate.into(),
      ..Default::default()
    }
  }

  /// Build the full snapshot of a freshly entered vehicle.
  pub fn into_vehicle(self, id: Option<String>) -> Vehicle {
    Vehicle {
      id,
      plate: self.plate,
      model: self.model,
      color: self.color,
      owner: self.owner,
      tag: self.tag,
      notes: self.notes,
      entered_at: self.entered_at.unwrap_or_else(Utc::now),
      exited_at: None,
      status: VehicleStatus::Inside,
      sync_timestamp: None,
    }
  }
}

/// Partial update of a vehicle record.
///
/// Identity, entry time and the ordering token are deliberately absent: they
/// cannot be changed through an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub plate: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub color: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<VehicleStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exited_at: Option<DateTime<Utc>>,
}

impl VehiclePatch {
  /// The exit mutation: status becomes `EXITED` at the given time.
  pub fn exit(at: DateTime<Utc>) -> Self {
    Self {
      status: Some(VehicleStatus::Exited),
      exited_at: Some(at),
      ..Default::default()
    }
  }

  /// Stamp the exit time when the patch only flips the status to `EXITED`,
  /// so every replica records the same instant.
  pub fn normalized(mut self) -> Self {
    if self.status == Some(VehicleStatus::Exited) && self.exited_at.is_none() {
      self.exited_at = Some(Utc::now());
    }
    self
  }

  pub fn is_empty(&self) -> bool {
    self == &VehiclePatch::default()
  }

  /// Check the patch on its own, before any snapshot is looked up.
  pub fn validate(&self) -> SyncResult<()> {
    if self.is_empty() {
      return Err(SyncError::InvalidPatch("no fields to update".to_string()));
    }
    if self.exited_at.is_some() && self.status == Some(VehicleStatus::Inside) {
      return Err(SyncError::InvalidPatch(
        "exit time given for a vehicle marked INSIDE".to_string(),
      ));
    }
    if matches!(&self.plate, Some(p) if p.trim().is_empty()) {
      return Err(SyncError::InvalidPatch("plate cannot be blank".to_string()));
    }
    Ok(())
  }

  /// Names of the fields this patch touches, in remote field naming.
  pub fn field_names(&self) -> Vec<&'static str> {
    let mut names = Vec::new();
    if self.plate.is_some() {
      names.push("plate");
    }
    if self.model.is_some() {
      names.push("model");
    }
    if self.color.is_some() {
      names.push("color");
    }
    if self.owner.is_some() {
      names.push("owner");
    }
    if self.tag.is_some() {
      names.push("tag");
    }
    if self.notes.is_some() {
      names.push("notes");
    }
    if self.status.is_some() {
      names.push("status");
    }
    if self.exited_at.is_some() {
      names.push("exitedAt");
    }
    names
  }
}
