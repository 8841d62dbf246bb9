use thiserror::Error;

use crate::remote::RemoteError;

/// Errors surfaced to callers of the sync engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  #[error("Invalid vehicle identifier: {0:?}")]
  InvalidIdentifier(String),

  #[error("Invalid update: {0}")]
  InvalidPatch(String),

  #[error("Vehicle not found: {0}")]
  NotFoundLocal(String),

  #[error("Permission denied by remote store: {0}")]
  PermissionDenied(String),

  #[error("Remote store unavailable: {0}")]
  RemoteUnavailable(String),

  #[error("Vehicle no longer exists in remote store: {0}")]
  NotFoundRemote(String),

  #[error("Remote store error: {0}")]
  Remote(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<RemoteError> for SyncError {
  fn from(e: RemoteError) -> Self {
    match e {
      RemoteError::PermissionDenied(msg) => SyncError::PermissionDenied(msg),
      RemoteError::NotFound(msg) => SyncError::NotFoundRemote(msg),
      RemoteError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
      RemoteError::Other(msg) => SyncError::Remote(msg),
    }
  }
}
