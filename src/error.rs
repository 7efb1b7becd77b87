//! Error taxonomy for the sync engine.

use thiserror::Error;

/// Errors raised by the queue, cache and sweeper.
///
/// Only `Persistence` and `NotDurable` ever reach a caller of the public
/// engine API. Service errors are contained per mutation during a sweep and
/// `CacheConsistency` is healed internally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Durable storage is unavailable or full
  #[error("Persistence error: {message}")]
  Persistence { message: String },

  /// The optimistic update was applied but the mutation could not be persisted
  #[error("Mutation {local_id} was applied but may not survive a restart: {reason}")]
  NotDurable { local_id: String, reason: String },

  /// Network, timeout or 5xx failure, retried on a later sweep
  #[error("Transient service error: {message}")]
  TransientService { message: String },

  /// Validation, conflict or other 4xx failure, never retried
  #[error("Permanent service error: {message}")]
  PermanentService { message: String },

  /// Internal invariant violation in the read cache
  #[error("Cache consistency error: {message}")]
  CacheConsistency { message: String },

  /// A payload or stored value could not be (de)serialized
  #[error("Serialization error: {message}")]
  Serialization { message: String },
}

impl SyncError {
  pub fn persistence(message: impl Into<String>) -> Self {
    Self::Persistence {
      message: message.into(),
    }
  }

  pub fn cache_consistency(message: impl Into<String>) -> Self {
    Self::CacheConsistency {
      message: message.into(),
    }
  }

  pub fn serialization(message: impl Into<String>) -> Self {
    Self::Serialization {
      message: message.into(),
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::serialization(format!("JSON error: {}", err))
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(err: rusqlite::Error) -> Self {
    Self::persistence(format!("SQLite error: {}", err))
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;
