//! Read-through refetch on top of the optimistic cache.

use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::patcher::OptimisticPatcher;
use super::traits::{CacheEntry, CacheItem, CacheResult, Cacheable, QueryKey};
use crate::remote::ServiceError;

/// Cache layer that manages refetching and offline fallback.
///
/// Refetched rows replace the confirmed part of an entry, while placeholders
/// of still-pending mutations are carried over behind them.
pub struct CacheLayer<T> {
  patcher: Arc<OptimisticPatcher<T>>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<T: Cacheable + 'static> CacheLayer<T> {
  pub fn new(patcher: Arc<OptimisticPatcher<T>>) -> Self {
    Self {
      patcher,
      stale_time: Duration::minutes(2),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn is_fresh(&self, entry: &CacheEntry<T>) -> bool {
    entry
      .fetched_at()
      .map(|fetched_at| Utc::now() - fetched_at < self.stale_time)
      .unwrap_or(false)
  }

  /// Fetch a list with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return stale cache (offline mode)
  /// 4. Update cache with new data, keeping live placeholders
  pub async fn fetch_list<F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>, ServiceError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, ServiceError>>,
  {
    let cached = self.patcher.cache().get(key);

    if let Some(entry) = &cached {
      if self.is_fresh(entry) {
        if let Some(fetched_at) = entry.fetched_at() {
          return Ok(CacheResult::from_cache(entry.records().cloned().collect(), fetched_at));
        }
      }
    }

    match fetcher().await {
      Ok(rows) => {
        // Re-read: placeholders may have changed while the fetch was suspended
        let current = self.patcher.cache().get(key);
        let entry = self.merge(rows, current);
        let data = entry.records().cloned().collect();
        self.patcher.cache().set(key, entry);
        debug!(query_key = %key, "refetched cache entry");
        Ok(CacheResult::from_network(data))
      }
      Err(err) => match cached.as_ref().and_then(|e| e.fetched_at().map(|at| (e, at))) {
        Some((entry, fetched_at)) => {
          warn!(query_key = %key, error = %err, "refetch failed, serving stale cache");
          let current = self.patcher.cache().get(key).unwrap_or_else(|| entry.clone());
          Ok(CacheResult::offline(current.records().cloned().collect(), fetched_at))
        }
        None => Err(err),
      },
    }
  }

  fn merge(&self, rows: Vec<T>, current: Option<CacheEntry<T>>) -> CacheEntry<T> {
    let live = self.patcher.live_ids();
    let version = current.as_ref().map(|e| e.version() + 1).unwrap_or(0);
    let mut items: Vec<CacheItem<T>> = rows.into_iter().map(CacheItem::Confirmed).collect();
    if let Some(current) = current {
      items.extend(
        current
          .into_items()
          .into_iter()
          .filter(|item| item.local_id().is_some_and(|id| live.contains(id))),
      );
    }
    CacheEntry::from_items(items, version, Some(Utc::now()))
  }
}

impl<T> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      patcher: Arc::clone(&self.patcher),
      stale_time: self.stale_time,
    }
  }
}
