//! Error types for rrsync

use thiserror::Error;

use crate::cache::ResourceKind;

/// Result type alias using rrsync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the backend or the local store
#[derive(Error, Debug)]
pub enum Error {
  /// The local store is missing or could not stage a write.
  /// Nothing was queued, so the caller must surface this.
  #[error("Sync unavailable: {0}")]
  SyncUnavailable(String),

  /// Network failure with no offline fallback
  #[error("Network error: {0}")]
  Network(#[from] TransportError),

  /// The write failed on the network and was staged for replay
  #[error("{kind} {id} queued for retry")]
  Queued { kind: ResourceKind, id: i64 },

  /// Record not found (or hidden by a pending delete)
  #[error("Not found: {0}")]
  NotFound(String),

  /// Invalid input
  #[error("Invalid input: {0}")]
  InvalidInput(String),

  /// SQLite error
  #[error("Store error: {0}")]
  Store(#[from] rusqlite::Error),

  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// True when the write is sitting in the outbox and the UI may show
  /// its optimistic state.
  pub const fn is_queued(&self) -> bool {
    matches!(self, Self::Queued { .. })
  }
}

/// Failure reported by a [`Transport`](crate::api::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  /// Connection refused, DNS failure, timeout and friends
  #[error("backend unreachable: {0}")]
  Unreachable(String),

  /// The backend answered with a non-success status
  #[error("HTTP {status}: {body}")]
  Status { status: u16, body: String },
}

impl TransportError {
  /// Whether replaying the same request later could succeed.
  pub const fn is_retryable(&self) -> bool {
    match self {
      Self::Unreachable(_) => true,
      Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
    }
  }

  pub const fn is_not_found(&self) -> bool {
    matches!(self, Self::Status { status: 404, .. })
  }
}
