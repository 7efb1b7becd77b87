//! The sweeper, and the entry point for user writes.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use super::{FailureNotice, Mutation, SyncConfig, SyncSummary, SyncTrigger};
use crate::cache::{Cacheable, OptimisticPatcher, QueryKey, UndoToken};
use crate::connectivity::ConnectivitySignal;
use crate::error::{Result, SyncError};
use crate::queue::{new_local_id, MutationQueue, MutationStatus, PendingMutation};
use crate::remote::{FailureClass, RemoteService, ServiceError};
use crate::store::KeyValueStore;

/// Completion signal of the sweep currently running, if any.
type InProgress = Mutex<Option<watch::Receiver<Option<SyncSummary>>>>;

enum Step {
  Continue,
  Stop,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the in-progress slot when a sweep ends, even if its future is dropped.
struct SweepGuard<'a>(&'a InProgress);

impl Drop for SweepGuard<'_> {
  fn drop(&mut self) {
    *lock(self.0) = None;
  }
}

/// Coordinates the durable queue, the optimistic patcher and the remote
/// service.
///
/// Locks are only held for synchronous sections, never across an `.await`.
pub struct SyncEngine<M: Mutation, S, R> {
  queue: MutationQueue<S, M>,
  patcher: Arc<OptimisticPatcher<M::Record>>,
  remote: R,
  config: SyncConfig,
  /// Undo tokens of placeholders still shown, by local id
  tokens: Mutex<HashMap<String, UndoToken<M::Record>>>,
  /// Mutations whose durable enqueue failed; each is submitted once
  volatile: Mutex<Vec<PendingMutation<M>>>,
  pending_count: watch::Sender<usize>,
  notices_tx: mpsc::UnboundedSender<FailureNotice>,
  notices_rx: Mutex<Option<mpsc::UnboundedReceiver<FailureNotice>>>,
  connectivity: Option<ConnectivitySignal>,
  in_progress: InProgress,
  cancelled: AtomicBool,
  /// Wakes `watch_connectivity` on `cancel()`
  cancel_signal: Notify,
}

impl<M, S, R> SyncEngine<M, S, R>
where
  M: Mutation,
  S: KeyValueStore,
  R: RemoteService,
{
  pub fn new(
    store: S,
    remote: R,
    patcher: Arc<OptimisticPatcher<M::Record>>,
    config: SyncConfig,
  ) -> Self {
    let (pending_count, _) = watch::channel(0);
    let (notices_tx, notices_rx) = mpsc::unbounded_channel();

    Self {
      queue: MutationQueue::new(store),
      patcher,
      remote,
      config,
      tokens: Mutex::new(HashMap::new()),
      volatile: Mutex::new(Vec::new()),
      pending_count,
      notices_tx,
      notices_rx: Mutex::new(Some(notices_rx)),
      connectivity: None,
      in_progress: Mutex::new(None),
      cancelled: AtomicBool::new(false),
      cancel_signal: Notify::new(),
    }
  }

  /// Skip sweeps while `signal` reports the backend unreachable.
  pub fn with_connectivity(mut self, signal: ConnectivitySignal) -> Self {
    self.connectivity = Some(signal);
    self
  }

  pub fn patcher(&self) -> &Arc<OptimisticPatcher<M::Record>> {
    &self.patcher
  }

  pub fn queue(&self) -> &MutationQueue<S, M> {
    &self.queue
  }

  /// Number of mutations not yet confirmed, for badges.
  pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
    self.pending_count.subscribe()
  }

  /// Receiver of failure notices. Only the first caller gets it.
  pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<FailureNotice>> {
    lock(&self.notices_rx).take()
  }

  /// Stop the running sweep before its next item and end
  /// `watch_connectivity`. The item in flight still completes.
  ///
  /// A cancel issued while no sweep runs stops the next sweep before its
  /// first item.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
    self.cancel_signal.notify_waiters();
  }

  pub fn is_online(&self) -> bool {
    self
      .connectivity
      .as_ref()
      .map_or(true, |signal| signal.borrow().is_online())
  }

  /// Show `payload` in the cache immediately and queue it for the remote
  /// service.
  ///
  /// Fails with `SyncError::NotDurable` when the queue could not be written;
  /// the placeholder is still shown and the next sweep submits it once.
  pub async fn queue_mutation(&self, payload: M) -> Result<String> {
    self.queue_with_id(new_local_id(), payload).await
  }

  async fn queue_with_id(&self, local_id: String, payload: M) -> Result<String> {
    let query_key = payload.query_key();
    let placeholder = payload.placeholder(&local_id, Utc::now());
    let token = self.patcher.apply_optimistic(&query_key, &local_id, placeholder);
    lock(&self.tokens).insert(local_id.clone(), token);

    let mutation = PendingMutation::new(local_id.clone(), payload, query_key);
    let result = match self.queue.enqueue(mutation.clone()).await {
      Ok(()) => {
        info!(%local_id, query_key = %mutation.query_key, "queued mutation");
        Ok(local_id)
      }
      Err(err) => {
        warn!(%local_id, error = %err, "mutation not stored durably");
        lock(&self.volatile).push(mutation);
        Err(SyncError::NotDurable {
          local_id,
          reason: err.to_string(),
        })
      }
    };
    self.publish_pending_count().await;
    result
  }

  /// Re-apply placeholders for everything left in the queue by a previous
  /// run. Returns how many were restored.
  pub async fn restore(&self) -> Result<usize> {
    let pending = self.queue.list_pending().await?;
    for mutation in &pending {
      let placeholder = mutation.payload.placeholder(&mutation.local_id, mutation.created_at);
      let token = self
        .patcher
        .apply_optimistic(&mutation.query_key, &mutation.local_id, placeholder);
      lock(&self.tokens).insert(mutation.local_id.clone(), token);
    }
    self.publish_pending_count().await;
    if !pending.is_empty() {
      info!(count = pending.len(), "restored pending mutations");
    }
    Ok(pending.len())
  }

  /// Mutations not yet confirmed, oldest first.
  pub async fn pending(&self) -> Result<Vec<PendingMutation<M>>> {
    let mut pending = self.queue.list_pending().await?;
    pending.extend(lock(&self.volatile).iter().cloned());
    pending.sort_by_key(|m| m.created_at);
    Ok(pending)
  }

  pub async fn last_sync(&self) -> Result<Option<chrono::DateTime<Utc>>> {
    self.queue.last_sync().await
  }

  /// Drop every unconfirmed mutation and remove its placeholder.
  pub async fn clear(&self) -> Result<()> {
    self.queue.clear().await?;
    lock(&self.volatile).clear();
    let tokens: Vec<_> = lock(&self.tokens).drain().map(|(_, token)| token).collect();
    for token in &tokens {
      self.patcher.rollback(token);
    }
    self.pending_count.send_replace(0);
    info!(reverted = tokens.len(), "cleared offline data");
    Ok(())
  }

  /// Run one sweep over the queue. Never fails; per-item failures are only
  /// reflected in the summary and in failure notices.
  ///
  /// A trigger arriving while a sweep runs waits for that sweep and returns
  /// its summary instead of starting another one.
  pub async fn trigger_sync(&self, trigger: SyncTrigger) -> SyncSummary {
    let running = {
      let mut slot = lock(&self.in_progress);
      match slot.as_ref() {
        Some(rx) => Err(rx.clone()),
        None => {
          let (tx, rx) = watch::channel(None);
          *slot = Some(rx);
          Ok(tx)
        }
      }
    };

    let done = match running {
      Ok(tx) => tx,
      Err(mut rx) => {
        debug!(?trigger, "sync already running, joining it");
        return rx
          .wait_for(Option::is_some)
          .await
          .ok()
          .and_then(|summary| *summary)
          .unwrap_or_default();
      }
    };

    let _guard = SweepGuard(&self.in_progress);
    let summary = self.sweep(trigger).await;
    done.send_replace(Some(summary));
    summary
  }

  /// Sweep whenever `signal` goes from offline to online. Returns when the
  /// signal's sender is dropped or on `cancel()`, after the sweep in
  /// progress has stopped.
  pub async fn watch_connectivity(&self, mut signal: ConnectivitySignal) {
    let cancelled = self.cancel_signal.notified();
    tokio::pin!(cancelled);
    cancelled.as_mut().enable();
    if self.cancelled.load(Ordering::SeqCst) {
      return;
    }

    let mut was_online = signal.borrow_and_update().is_online();
    loop {
      tokio::select! {
        biased;
        _ = &mut cancelled => {
          info!("stopped watching connectivity");
          break;
        }
        changed = signal.changed() => {
          if changed.is_err() {
            break;
          }
          let online = signal.borrow_and_update().is_online();
          if online && !was_online {
            info!("connectivity restored");
            let summary = self.trigger_sync(SyncTrigger::ConnectivityRestored).await;
            debug!(?summary, "reconnect sync done");
          }
          was_online = online;
        }
      }
    }
  }

  async fn sweep(&self, trigger: SyncTrigger) -> SyncSummary {
    let mut summary = SyncSummary::default();
    if !self.is_online() {
      info!(?trigger, "offline, skipping sync");
      return summary;
    }

    let durable = match self.queue.list_pending().await {
      Ok(pending) => pending,
      Err(err) => {
        error!(error = %err, "failed to read mutation queue");
        Vec::new()
      }
    };
    let volatile = std::mem::take(&mut *lock(&self.volatile));

    let mut batch: Vec<(PendingMutation<M>, bool)> = durable
      .into_iter()
      .map(|m| (m, true))
      .chain(volatile.into_iter().map(|m| (m, false)))
      .collect();
    batch.sort_by_key(|(m, _)| m.created_at);
    info!(?trigger, count = batch.len(), "starting sync");

    let mut items = batch.into_iter().peekable();
    while items.peek().is_some() {
      if self.cancelled.load(Ordering::SeqCst) {
        info!("sync cancelled");
        break;
      }
      let Some((mutation, durable)) = items.next() else {
        break;
      };
      if let Step::Stop = self.submit(&mutation, durable, &mut summary).await {
        break;
      }
    }

    self.cancelled.store(false, Ordering::SeqCst);

    // Unsent volatile mutations keep their turn ahead of newer ones, unless
    // `clear()` dropped them meanwhile
    let unsent: Vec<_> = {
      let tokens = lock(&self.tokens);
      items
        .filter(|(m, durable)| !durable && tokens.contains_key(&m.local_id))
        .map(|(m, _)| m)
        .collect()
    };
    if !unsent.is_empty() {
      let mut volatile = lock(&self.volatile);
      let newer = std::mem::replace(&mut *volatile, unsent);
      volatile.extend(newer);
    }

    if let Err(err) = self.queue.mark_synced(Utc::now()).await {
      warn!(error = %err, "failed to record sync time");
    }
    self.publish_pending_count().await;

    info!(
      committed = summary.committed,
      failed = summary.failed,
      reverted = summary.reverted,
      "sync finished"
    );
    summary
  }

  async fn submit(
    &self,
    mutation: &PendingMutation<M>,
    durable: bool,
    summary: &mut SyncSummary,
  ) -> Step {
    let local_id = mutation.local_id.as_str();
    // The batch is a copy; `clear()` may have dropped this mutation since
    let still_queued = if durable {
      match self.queue.update_status(local_id, MutationStatus::InFlight).await {
        Ok(found) => found,
        Err(err) => {
          warn!(%local_id, error = %err, "failed to mark mutation in flight");
          true
        }
      }
    } else {
      lock(&self.tokens).contains_key(local_id)
    };
    if !still_queued {
      debug!(%local_id, "mutation no longer queued, skipping");
      return Step::Continue;
    }
    debug!(%local_id, attempt = mutation.attempt_count + 1, durable, "submitting mutation");

    let result = match serde_json::to_value(&mutation.payload) {
      Ok(payload) => self.send(mutation.payload.resource_type(), &payload).await,
      Err(err) => Err(ServiceError::validation(format!("Unserializable payload: {}", err))),
    };

    match result {
      Ok(row) => {
        self.confirm(mutation, durable, row).await;
        summary.committed += 1;
        Step::Continue
      }
      Err(err) => {
        summary.failed += 1;
        self.handle_failure(mutation, durable, err, summary).await
      }
    }
  }

  async fn send(
    &self,
    resource_type: &str,
    payload: &Value,
  ) -> std::result::Result<Value, ServiceError> {
    let timeout = self.config.request_timeout;
    match tokio::time::timeout(timeout, self.remote.create(resource_type, payload)).await {
      Ok(result) => result,
      Err(_) => Err(ServiceError::timeout(format!(
        "no response within {}s",
        timeout.as_secs_f32()
      ))),
    }
  }

  async fn confirm(&self, mutation: &PendingMutation<M>, durable: bool, row: Value) {
    let local_id = mutation.local_id.as_str();
    match serde_json::from_value::<M::Record>(row) {
      Ok(record) => {
        let server_id = record.cache_key();
        lock(&self.tokens).remove(local_id);
        self.patcher.commit(&mutation.query_key, local_id, record);
        info!(%local_id, %server_id, "mutation committed");
      }
      Err(err) => {
        // Stored remotely all the same; the next refetch brings the row in
        warn!(%local_id, error = %err, "confirmed row could not be read");
        self.undo(local_id, &mutation.query_key);
      }
    }

    if durable {
      if let Err(err) = self.queue.remove(local_id).await {
        error!(%local_id, error = %err, "failed to remove committed mutation");
      }
    }
  }

  async fn handle_failure(
    &self,
    mutation: &PendingMutation<M>,
    durable: bool,
    err: ServiceError,
    summary: &mut SyncSummary,
  ) -> Step {
    let local_id = mutation.local_id.as_str();
    match err.class() {
      FailureClass::Unauthorized if durable => {
        warn!(%local_id, error = %err, "not authorized, stopping sync");
        if let Err(e) = self.queue.update_status(local_id, MutationStatus::Pending).await {
          warn!(%local_id, error = %e, "failed to reset mutation status");
        }
        Step::Stop
      }
      FailureClass::Unauthorized => {
        self.revert(mutation, durable, err.to_string()).await;
        summary.reverted += 1;
        Step::Stop
      }
      FailureClass::Transient if durable && mutation.attempt_count < self.config.retry_ceiling => {
        warn!(
          %local_id,
          attempt = mutation.attempt_count + 1,
          error = %err,
          "mutation failed, retrying on next sync"
        );
        if let Err(e) = self.queue.record_failure(local_id, &err.to_string()).await {
          error!(%local_id, error = %e, "failed to record mutation failure");
        }
        Step::Continue
      }
      _ => {
        self.revert(mutation, durable, err.to_string()).await;
        summary.reverted += 1;
        Step::Continue
      }
    }
  }

  /// Terminal failure: roll back, drop from the queue, notify.
  async fn revert(&self, mutation: &PendingMutation<M>, durable: bool, reason: String) {
    let local_id = mutation.local_id.as_str();
    if durable {
      if let Err(err) = self.queue.update_status(local_id, MutationStatus::Failed).await {
        warn!(%local_id, error = %err, "failed to mark mutation failed");
      }
    }

    self.undo(local_id, &mutation.query_key);

    if durable {
      if let Err(err) = self.queue.remove(local_id).await {
        error!(%local_id, error = %err, "failed to remove reverted mutation");
      }
    }

    warn!(%local_id, %reason, "mutation reverted");
    let notice = FailureNotice {
      local_id: local_id.to_string(),
      description: mutation.payload.describe(),
      reason,
    };
    if self.notices_tx.send(notice).is_err() {
      debug!(%local_id, "no listener for failure notices");
    }
  }

  fn undo(&self, local_id: &str, query_key: &QueryKey) {
    let token = lock(&self.tokens).remove(local_id);
    match token {
      Some(token) => {
        self.patcher.rollback(&token);
      }
      None => {
        let err = SyncError::cache_consistency(format!("no undo token for {}", local_id));
        error!(error = %err, %query_key, "clearing cache entry");
        self.patcher.clear_entry(query_key);
      }
    }
  }

  async fn publish_pending_count(&self) {
    let durable = match self.queue.len().await {
      Ok(count) => count,
      Err(err) => {
        warn!(error = %err, "failed to count pending mutations");
        return;
      }
    };
    let count = durable + lock(&self.volatile).len();
    self.pending_count.send_replace(count);
  }
}
