//! Reconciliation of queued mutations against the remote service.
//!
//! A user write goes through `SyncEngine::queue_mutation`, which shows a
//! placeholder in the read cache right away and stores the mutation in the
//! durable queue. `SyncEngine::trigger_sync` later drains the queue in FIFO
//! order, replacing each placeholder with the confirmed row or removing it.

mod engine;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::cache::{Cacheable, QueryKey};

pub use engine::SyncEngine;

/// A write the user can make while offline.
pub trait Mutation: Clone + Serialize + DeserializeOwned {
  /// The row the remote service stores for this write
  type Record: Cacheable + 'static;

  /// Remote resource the payload is created in.
  fn resource_type(&self) -> &str;

  /// Cache entry the placeholder is shown in.
  fn query_key(&self) -> QueryKey;

  /// The record shown until the remote service confirms the write.
  fn placeholder(&self, local_id: &str, created_at: DateTime<Utc>) -> Self::Record;

  /// Human-readable action name for failure notices.
  fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Retryable failures tolerated before a mutation is reverted
  pub retry_ceiling: u32,
  /// Deadline of one remote write
  pub request_timeout: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      retry_ceiling: 3,
      request_timeout: Duration::from_secs(15),
    }
  }
}

/// What started a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  ConnectivityRestored,
  /// "Sync now"
  Manual,
  /// The app came back to the foreground
  Foreground,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
  /// Mutations confirmed and removed from the queue
  pub committed: usize,
  /// Mutations whose remote write failed, retryable or not
  pub failed: usize,
  /// Failed mutations that were rolled back and dropped
  pub reverted: usize,
}

impl SyncSummary {
  pub fn is_empty(&self) -> bool {
    self.committed == 0 && self.failed == 0
  }
}

/// A mutation that was reverted and will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
  pub local_id: String,
  /// Which action failed, e.g. "Log habit h1 for 2024-03-01"
  pub description: String,
  pub reason: String,
}
