//! Read-cache abstraction and its in-memory implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, QueryKey};

/// Keyed store of query results.
///
/// All operations are synchronous and never perform I/O, so they are safe to
/// call from the immediate path of a user action.
pub trait ReadCache<T>: Send + Sync {
  /// Get a copy of the entry for `key`.
  fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>>;

  /// Replace the entry for `key`.
  fn set(&self, key: &QueryKey, entry: CacheEntry<T>);

  /// Drop the entry for `key`. Returns whether one was present.
  fn invalidate(&self, key: &QueryKey) -> bool;

  /// Drop every entry whose key starts with `prefix`. Returns the count dropped.
  fn invalidate_prefix(&self, prefix: &QueryKey) -> usize;

  /// Copies of all entries.
  fn entries(&self) -> Vec<(QueryKey, CacheEntry<T>)>;
}

/// Process-local read cache.
#[derive(Debug)]
pub struct MemoryCache<T> {
  entries: Mutex<HashMap<QueryKey, CacheEntry<T>>>,
}

impl<T> MemoryCache<T> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry<T>>> {
    // Every write is a single insert or remove, so a poisoned map is still consistent.
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<T> Default for MemoryCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send> ReadCache<T> for MemoryCache<T> {
  fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.lock().get(key).cloned()
  }

  fn set(&self, key: &QueryKey, entry: CacheEntry<T>) {
    self.lock().insert(key.clone(), entry);
  }

  fn invalidate(&self, key: &QueryKey) -> bool {
    self.lock().remove(key).is_some()
  }

  fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|key, _| !key.starts_with(prefix));
    before - entries.len()
  }

  fn entries(&self) -> Vec<(QueryKey, CacheEntry<T>)> {
    self
      .lock()
      .iter()
      .map(|(key, entry)| (key.clone(), entry.clone()))
      .collect()
  }
}
