//! Error taxonomy of the offline layer.
//!
//! Only [`SyncError::NoDataAvailable`] ever reaches callers of
//! `SyncCoordinator::read`; the other variants describe failures that are
//! absorbed (logged, retried or degraded) and surface through logs and
//! `SyncEvent`s.

use thiserror::Error;

use crate::queue::WriteId;

#[derive(Debug, Error)]
pub enum SyncError {
  /// A network call failed or timed out while the device was believed online.
  #[error("network call failed while connected: {0}")]
  TransientNetworkFailure(String),

  /// Neither the network nor the cache could produce a value.
  #[error("no data available for {key}")]
  NoDataAvailable { key: String },

  /// The remote system rejected a queued write during replay.
  #[error("replay of queued write {id} failed: {reason}")]
  QueueReplayFailure { id: WriteId, reason: String },

  /// A cached record could not be decoded and was discarded.
  #[error("corrupt cache entry {key}: {reason}")]
  CorruptCacheEntry { key: String, reason: String },
}

/// Why replaying a queued write did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
  /// Worth retrying later (offline again, 5xx, auth expiry). The item stays
  /// queued and the drain stops.
  #[error("transient: {0}")]
  Transient(String),

  /// The remote system will never accept this write (e.g. the target entity
  /// was deleted, 404). The item is discarded and the drain continues.
  #[error("rejected: {0}")]
  Rejected(String),
}

impl ReplayError {
  pub fn transient(reason: impl Into<String>) -> Self {
    Self::Transient(reason.into())
  }

  pub fn rejected(reason: impl Into<String>) -> Self {
    Self::Rejected(reason.into())
  }

  pub fn is_permanent(&self) -> bool {
    matches!(self, Self::Rejected(_))
  }

  pub fn reason(&self) -> &str {
    match self {
      Self::Transient(reason) | Self::Rejected(reason) => reason,
    }
  }
}

impl From<color_eyre::Report> for ReplayError {
  fn from(err: color_eyre::Report) -> Self {
    Self::Transient(err.to_string())
  }
}
