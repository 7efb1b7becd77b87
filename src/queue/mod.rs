//! Durable FIFO queue of mutations the remote service has not confirmed.
//!
//! The whole queue is stored as one serialized list. Every operation re-reads
//! the persisted list right before writing it back, so no stale copy is ever
//! carried across a suspension point.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::QueryKey;
use crate::error::{Result, SyncError};
use crate::store::KeyValueStore;

/// Storage key of the pending mutation list.
pub const QUEUE_STORAGE_KEY: &str = "@offline_sync_queue";

/// Storage key of the last completed sweep timestamp.
pub const LAST_SYNC_STORAGE_KEY: &str = "@offline_last_sync";

/// Prefix distinguishing client-generated ids from server ids.
pub const LOCAL_ID_PREFIX: &str = "temp-";

/// Generate a fresh local id of the form `temp-<millis>-<random>`.
pub fn new_local_id() -> String {
  let random = Uuid::new_v4().simple().to_string();
  format!(
    "{}{}-{}",
    LOCAL_ID_PREFIX,
    Utc::now().timestamp_millis(),
    &random[..9]
  )
}

/// Lifecycle status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
  /// Waiting for the next sweep
  Pending,
  /// Submitted to the remote service by the current sweep
  InFlight,
  /// Terminally failed, about to be removed
  Failed,
}

/// One write not yet confirmed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation<P> {
  pub local_id: String,
  pub payload: P,
  /// Cache entry holding this mutation's placeholder
  pub query_key: QueryKey,
  pub created_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub status: MutationStatus,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl<P> PendingMutation<P> {
  pub fn new(local_id: impl Into<String>, payload: P, query_key: QueryKey) -> Self {
    Self {
      local_id: local_id.into(),
      payload,
      query_key,
      created_at: Utc::now(),
      attempt_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
    }
  }
}

/// Durable queue of `PendingMutation`s over a key-value store.
pub struct MutationQueue<S, P> {
  store: S,
  _payload: PhantomData<fn() -> P>,
}

impl<S, P> MutationQueue<S, P>
where
  S: KeyValueStore,
  P: Serialize + DeserializeOwned,
{
  pub fn new(store: S) -> Self {
    Self {
      store,
      _payload: PhantomData,
    }
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  async fn read(&self) -> Result<Vec<PendingMutation<P>>> {
    match self.store.get(QUEUE_STORAGE_KEY).await? {
      Some(raw) => serde_json::from_str(&raw)
        .map_err(|e| SyncError::persistence(format!("Corrupt mutation queue: {}", e))),
      None => Ok(Vec::new()),
    }
  }

  async fn write(&self, mutations: &[PendingMutation<P>]) -> Result<()> {
    let raw = serde_json::to_string(mutations)?;
    self.store.set(QUEUE_STORAGE_KEY, &raw).await
  }

  /// Append a mutation at the back of the queue.
  pub async fn enqueue(&self, mutation: PendingMutation<P>) -> Result<()> {
    let mut mutations = self.read().await?;
    if mutations.iter().any(|m| m.local_id == mutation.local_id) {
      warn!(local_id = %mutation.local_id, "mutation already queued");
      return Ok(());
    }
    debug!(local_id = %mutation.local_id, "enqueued mutation");
    mutations.push(mutation);
    self.write(&mutations).await
  }

  /// All non-terminal mutations in insertion order.
  ///
  /// Mutations left `InFlight` by an interrupted sweep are included so they
  /// are delivered at least once.
  pub async fn list_pending(&self) -> Result<Vec<PendingMutation<P>>> {
    let mutations = self.read().await?;
    Ok(
      mutations
        .into_iter()
        .filter(|m| m.status != MutationStatus::Failed)
        .collect(),
    )
  }

  /// Delete one mutation. Removing a missing id is a no-op.
  ///
  /// Returns whether a mutation was removed.
  pub async fn remove(&self, local_id: &str) -> Result<bool> {
    let mut mutations = self.read().await?;
    let before = mutations.len();
    mutations.retain(|m| m.local_id != local_id);
    if mutations.len() == before {
      return Ok(false);
    }
    self.write(&mutations).await?;
    debug!(%local_id, "removed mutation");
    Ok(true)
  }

  /// Transition a mutation's status. A missing id is logged, not an error.
  ///
  /// Returns whether the mutation still exists.
  pub async fn update_status(&self, local_id: &str, status: MutationStatus) -> Result<bool> {
    let mut mutations = self.read().await?;
    let Some(mutation) = mutations.iter_mut().find(|m| m.local_id == local_id) else {
      warn!(%local_id, ?status, "status update for unknown mutation");
      return Ok(false);
    };
    mutation.status = status;
    self.write(&mutations).await?;
    Ok(true)
  }

  /// Put a mutation back to `Pending` after a retryable failure.
  ///
  /// Returns the new attempt count, or `None` if the id no longer exists.
  pub async fn record_failure(&self, local_id: &str, reason: &str) -> Result<Option<u32>> {
    let mut mutations = self.read().await?;
    let Some(mutation) = mutations.iter_mut().find(|m| m.local_id == local_id) else {
      warn!(%local_id, "failure recorded for unknown mutation");
      return Ok(None);
    };
    mutation.status = MutationStatus::Pending;
    mutation.attempt_count += 1;
    mutation.last_error = Some(reason.to_string());
    let attempts = mutation.attempt_count;
    self.write(&mutations).await?;
    Ok(Some(attempts))
  }

  /// Number of non-terminal mutations.
  pub async fn len(&self) -> Result<usize> {
    Ok(self.list_pending().await?.len())
  }

  pub async fn is_empty(&self) -> Result<bool> {
    Ok(self.len().await? == 0)
  }

  /// Drop every queued mutation and the last-sync marker.
  pub async fn clear(&self) -> Result<()> {
    self.store.remove(QUEUE_STORAGE_KEY).await?;
    self.store.remove(LAST_SYNC_STORAGE_KEY).await?;
    debug!("cleared offline data");
    Ok(())
  }

  /// When the last sweep completed.
  pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = self.store.get(LAST_SYNC_STORAGE_KEY).await? else {
      return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
      .map(|at| Some(at.with_timezone(&Utc)))
      .map_err(|e| SyncError::persistence(format!("Corrupt last sync timestamp '{}': {}", raw, e)))
  }

  pub async fn mark_synced(&self, at: DateTime<Utc>) -> Result<()> {
    self.store.set(LAST_SYNC_STORAGE_KEY, &at.to_rfc3339()).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{FailingStore, MemoryStore};

  fn queue() -> MutationQueue<MemoryStore, u32> {
    MutationQueue::new(MemoryStore::new())
  }

  fn mutation(id: &str) -> PendingMutation<u32> {
    PendingMutation::new(id, 1, QueryKey::new(["habits"]))
  }

  fn ids(mutations: &[PendingMutation<u32>]) -> Vec<&str> {
    mutations.iter().map(|m| m.local_id.as_str()).collect()
  }

  #[test]
  fn test_local_id_format() {
    let id = new_local_id();
    assert!(id.starts_with(LOCAL_ID_PREFIX));
    assert_eq!(id.split('-').count(), 3);
    assert_ne!(id, new_local_id());
  }

  #[tokio::test]
  async fn test_list_pending_is_fifo() {
    let queue = queue();
    for id in ["A", "B", "C"] {
      queue.enqueue(mutation(id)).await.unwrap();
    }

    assert_eq!(ids(&queue.list_pending().await.unwrap()), vec!["A", "B", "C"]);
  }

  #[tokio::test]
  async fn test_remove_is_idempotent() {
    let queue = queue();
    queue.enqueue(mutation("A")).await.unwrap();
    queue.enqueue(mutation("B")).await.unwrap();

    assert!(queue.remove("A").await.unwrap());
    let once = queue.list_pending().await.unwrap();
    assert!(!queue.remove("A").await.unwrap());
    assert_eq!(queue.list_pending().await.unwrap(), once);
  }

  #[tokio::test]
  async fn test_update_status_unknown_id_is_silent() {
    let queue = queue();
    assert!(!queue.update_status("missing", MutationStatus::InFlight).await.unwrap());
    assert_eq!(queue.record_failure("missing", "x").await.unwrap(), None);
    assert!(queue.is_empty().await.unwrap());
  }

  #[tokio::test]
  async fn test_failed_mutations_are_not_pending() {
    let queue = queue();
    queue.enqueue(mutation("A")).await.unwrap();
    queue.enqueue(mutation("B")).await.unwrap();
    assert!(queue.update_status("A", MutationStatus::InFlight).await.unwrap());
    assert!(queue.update_status("B", MutationStatus::Failed).await.unwrap());

    let pending = queue.list_pending().await.unwrap();
    assert_eq!(ids(&pending), vec!["A"]);
    assert_eq!(pending[0].status, MutationStatus::InFlight);
  }

  #[tokio::test]
  async fn test_record_failure_bumps_attempts() {
    let queue = queue();
    queue.enqueue(mutation("A")).await.unwrap();
    queue.update_status("A", MutationStatus::InFlight).await.unwrap();

    assert_eq!(queue.record_failure("A", "timeout").await.unwrap(), Some(1));
    assert_eq!(queue.record_failure("A", "timeout").await.unwrap(), Some(2));
    let pending = queue.list_pending().await.unwrap();
    assert_eq!(pending[0].status, MutationStatus::Pending);
    assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
  }

  #[tokio::test]
  async fn test_enqueue_reports_storage_failure() {
    let queue: MutationQueue<FailingStore, u32> = MutationQueue::new(FailingStore::default());
    queue.store().set_fail_writes(true);

    assert!(matches!(
      queue.enqueue(mutation("A")).await,
      Err(SyncError::Persistence { .. })
    ));
    assert!(queue.is_empty().await.unwrap());
  }

  #[tokio::test]
  async fn test_queue_survives_new_instance() {
    let store = std::sync::Arc::new(MemoryStore::new());
    MutationQueue::<_, u32>::new(std::sync::Arc::clone(&store))
      .enqueue(mutation("A"))
      .await
      .unwrap();

    let reopened: MutationQueue<_, u32> = MutationQueue::new(store);
    assert_eq!(ids(&reopened.list_pending().await.unwrap()), vec!["A"]);
  }

  #[tokio::test]
  async fn test_clear_and_last_sync() {
    let queue = queue();
    let at = Utc::now();
    queue.enqueue(mutation("A")).await.unwrap();
    queue.mark_synced(at).await.unwrap();
    assert_eq!(
      queue.last_sync().await.unwrap().map(|t| t.timestamp_millis()),
      Some(at.timestamp_millis())
    );

    queue.clear().await.unwrap();
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(queue.last_sync().await.unwrap(), None);
  }
}
