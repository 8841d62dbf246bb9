//! Offline-first synchronization.
//!
//! [`SyncEngine`] routes every mutation either straight to the remote store
//! or into the local cache plus the pending mutation log, and reconciles the
//! two on reconnect. [`LiveFeed`] publishes the current vehicle set.

mod engine;
mod feed;

use serde::Deserialize;

pub use engine::{ReconnectWorker, SyncEngine};
pub use feed::LiveFeed;

/// What a sync pass does with mutations whose replay failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
  /// Clear the whole log after the pass. Failed mutations are lost.
  #[default]
  DiscardOnCompletion,
  /// Clear the log, then queue the failed mutations again for the next pass.
  RetainFailed,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// False when the pass was skipped because the device was offline
  pub ran: bool,
  pub replayed: usize,
  pub skipped: usize,
  pub failed: usize,
  /// Failed mutations queued again under [`ReplayPolicy::RetainFailed`]
  pub retained: usize,
  pub migrated: usize,
  pub migration_failed: usize,
}

impl SyncReport {
  /// Failed mutations dropped from the log for good.
  pub fn discarded(&self) -> usize {
    self.failed - self.retained
  }
}

impl std::fmt::Display for SyncReport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if !self.ran {
      return write!(f, "skipped (offline)");
    }
    write!(
      f,
      "replayed {}, skipped {}, failed {} ({} discarded), migrated {}, migration failures {}",
      self.replayed,
      self.skipped,
      self.failed,
      self.discarded(),
      self.migrated,
      self.migration_failed
    )
  }
}

/// Point-in-time view of the engine's local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
  pub online: bool,
  pub cached: usize,
  pub local_only: usize,
  pub pending: usize,
}
