//! Optimistic placeholder insertion, replacement and removal.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

use super::memory::ReadCache;
use super::traits::{CacheEntry, CacheItem, Cacheable, QueryKey};
use crate::error::SyncError;

/// Everything needed to reverse one optimistic insertion.
///
/// The primary instruction is "strip the placeholder for `local_id`"; the
/// snapshot of the entry before insertion is only used when the entry has
/// since disappeared from the cache altogether.
#[derive(Debug, Clone)]
pub struct UndoToken<T> {
  query_key: QueryKey,
  local_id: String,
  snapshot: Option<CacheEntry<T>>,
}

impl<T> UndoToken<T> {
  pub fn query_key(&self) -> &QueryKey {
    &self.query_key
  }

  pub fn local_id(&self) -> &str {
    &self.local_id
  }

  /// The entry as it was right before the placeholder went in.
  pub fn snapshot(&self) -> Option<&CacheEntry<T>> {
    self.snapshot.as_ref()
  }
}

/// What a rollback did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
  /// The placeholder was stripped from the current entry
  Removed,
  /// The entry was gone and has been rebuilt from the snapshot
  Restored,
  /// Nothing to undo
  Unchanged,
  /// The entry was inconsistent and has been dropped
  Cleared,
}

/// Sole writer of placeholders in the read cache.
///
/// Never suspends and never performs I/O.
pub struct OptimisticPatcher<T> {
  cache: Arc<dyn ReadCache<T>>,
  /// Local ids whose placeholder has been applied and not yet resolved
  live: Mutex<HashSet<String>>,
}

impl<T: Cacheable + 'static> OptimisticPatcher<T> {
  pub fn new(cache: Arc<dyn ReadCache<T>>) -> Self {
    Self {
      cache,
      live: Mutex::new(HashSet::new()),
    }
  }

  pub fn cache(&self) -> &Arc<dyn ReadCache<T>> {
    &self.cache
  }

  /// Insert `placeholder` for `local_id` at the end of the entry for `key`.
  ///
  /// Re-applying for a `local_id` that already has a placeholder replaces it
  /// in place, so there is never more than one per mutation.
  pub fn apply_optimistic(&self, key: &QueryKey, local_id: &str, placeholder: T) -> UndoToken<T> {
    let snapshot = self.cache.get(key);
    let mut entry = snapshot.clone().unwrap_or_else(CacheEntry::unfetched);

    let item = CacheItem::Optimistic {
      local_id: local_id.to_string(),
      record: placeholder,
    };
    match entry.placeholder_position(local_id) {
      Some(position) => {
        let items = entry.items_mut();
        items[position] = item;
        let mut seen = false;
        items.retain(|existing| {
          if !existing.is_placeholder_for(local_id) {
            return true;
          }
          let keep = !seen;
          seen = true;
          keep
        });
      }
      None => entry.items_mut().push(item),
    }
    entry.bump_version();
    self.cache.set(key, entry);
    self.live().insert(local_id.to_string());

    debug!(%local_id, query_key = %key, entity = T::entity_type(), "applied optimistic placeholder");

    UndoToken {
      query_key: key.clone(),
      local_id: local_id.to_string(),
      snapshot,
    }
  }

  /// Replace the placeholder for `local_id` with the confirmed record, in the
  /// same position.
  ///
  /// Returns false when there was no placeholder to replace; the confirmed
  /// row then arrives with the next refetch.
  pub fn commit(&self, key: &QueryKey, local_id: &str, confirmed: T) -> bool {
    self.live().remove(local_id);

    let Some(mut entry) = self.cache.get(key) else {
      debug!(%local_id, query_key = %key, "commit found no cache entry");
      return false;
    };

    match entry.placeholder_count(local_id) {
      0 => {
        debug!(%local_id, query_key = %key, "commit found no placeholder");
        false
      }
      1 => {
        let confirmed_key = confirmed.cache_key();
        let already_fetched = entry.confirmed().any(|r| r.cache_key() == confirmed_key);
        let Some(position) = entry.placeholder_position(local_id) else {
          return false;
        };
        let items = entry.items_mut();
        if already_fetched {
          // A refetch already delivered this row
          items.remove(position);
        } else {
          items[position] = CacheItem::Confirmed(confirmed);
        }
        entry.bump_version();
        self.cache.set(key, entry);
        debug!(%local_id, server_id = %confirmed_key, query_key = %key, "committed placeholder");
        true
      }
      count => {
        self.heal(key, local_id, count);
        false
      }
    }
  }

  /// Reverse the insertion described by `token`.
  ///
  /// Only the token's own placeholder is removed, so placeholders inserted
  /// later by other pending mutations survive.
  pub fn rollback(&self, token: &UndoToken<T>) -> RollbackOutcome {
    let key = &token.query_key;
    let local_id = token.local_id.as_str();
    self.live().remove(local_id);

    let outcome = match self.cache.get(key) {
      Some(mut entry) => match entry.placeholder_count(local_id) {
        0 => RollbackOutcome::Unchanged,
        1 => {
          entry.items_mut().retain(|item| !item.is_placeholder_for(local_id));
          if entry.is_empty() && token.snapshot.is_none() {
            self.cache.invalidate(key);
          } else {
            entry.bump_version();
            self.cache.set(key, entry);
          }
          RollbackOutcome::Removed
        }
        count => {
          self.heal(key, local_id, count);
          RollbackOutcome::Cleared
        }
      },
      None => match &token.snapshot {
        Some(snapshot) => {
          let live = self.live().clone();
          let items = snapshot
            .items()
            .iter()
            .filter(|item| match item.local_id() {
              None => true,
              Some(id) => live.contains(id),
            })
            .cloned()
            .collect();
          let restored = CacheEntry::from_items(items, snapshot.version() + 1, snapshot.fetched_at());
          self.cache.set(key, restored);
          RollbackOutcome::Restored
        }
        None => RollbackOutcome::Unchanged,
      },
    };

    debug!(%local_id, query_key = %key, ?outcome, "rolled back placeholder");
    outcome
  }

  /// Drop the entry for `key` outright, forgetting its placeholders.
  pub fn clear_entry(&self, key: &QueryKey) {
    if let Some(entry) = self.cache.get(key) {
      let mut live = self.live();
      for id in entry.items().iter().filter_map(CacheItem::local_id) {
        live.remove(id);
      }
    }
    self.cache.invalidate(key);
  }

  /// Whether `local_id` has an unresolved placeholder.
  pub fn is_live(&self, local_id: &str) -> bool {
    self.live().contains(local_id)
  }

  pub(crate) fn live_ids(&self) -> HashSet<String> {
    self.live().clone()
  }

  fn heal(&self, key: &QueryKey, local_id: &str, count: usize) {
    let err = SyncError::cache_consistency(format!(
      "{} placeholders for {} under {}",
      count, local_id, key
    ));
    error!(error = %err, "clearing inconsistent cache entry");
    self.clear_entry(key);
  }

  fn live(&self) -> MutexGuard<'_, HashSet<String>> {
    self.live.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::MemoryCache;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub(crate) struct Row {
    pub id: String,
    pub value: u32,
  }

  impl Row {
    pub(crate) fn new(id: &str, value: u32) -> Self {
      Self {
        id: id.to_string(),
        value,
      }
    }
  }

  impl Cacheable for Row {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn updated_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
      None
    }

    fn entity_type() -> &'static str {
      "row"
    }
  }

  fn setup(rows: Vec<Row>) -> (OptimisticPatcher<Row>, QueryKey) {
    let cache: Arc<dyn ReadCache<Row>> = Arc::new(MemoryCache::new());
    let key = QueryKey::new(["rows", "today"]);
    cache.set(&key, CacheEntry::new(rows));
    (OptimisticPatcher::new(cache), key)
  }

  fn ids(patcher: &OptimisticPatcher<Row>, key: &QueryKey) -> Vec<String> {
    patcher
      .cache()
      .get(key)
      .map(|entry| entry.records().map(|r| r.id.clone()).collect())
      .unwrap_or_default()
  }

  #[test]
  fn test_rollback_restores_exact_entry() {
    let (patcher, key) = setup(vec![Row::new("x", 1), Row::new("y", 2)]);
    let before = patcher.cache().get(&key).unwrap();

    let token = patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 3));
    assert_eq!(ids(&patcher, &key), vec!["x", "y", "temp-p"]);
    assert_eq!(token.snapshot(), Some(&before));

    assert_eq!(patcher.rollback(&token), RollbackOutcome::Removed);
    let after = patcher.cache().get(&key).unwrap();
    assert_eq!(after.items(), before.items());
    assert!(!patcher.is_live("temp-p"));
  }

  #[test]
  fn test_commit_replaces_in_place() {
    let (patcher, key) = setup(vec![Row::new("x", 1), Row::new("y", 2)]);
    patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 3));

    assert!(patcher.commit(&key, "temp-p", Row::new("srv-1", 3)));
    let entry = patcher.cache().get(&key).unwrap();
    assert_eq!(ids(&patcher, &key), vec!["x", "y", "srv-1"]);
    assert!(matches!(entry.items()[2], CacheItem::Confirmed(_)));
  }

  #[test]
  fn test_rollback_keeps_concurrent_placeholder() {
    let (patcher, key) = setup(vec![Row::new("x", 1)]);
    let token_a = patcher.apply_optimistic(&key, "temp-a", Row::new("temp-a", 1));
    patcher.apply_optimistic(&key, "temp-b", Row::new("temp-b", 2));

    patcher.rollback(&token_a);
    assert_eq!(ids(&patcher, &key), vec!["x", "temp-b"]);
    assert!(patcher.is_live("temp-b"));
  }

  #[test]
  fn test_rollback_after_invalidation_restores_snapshot() {
    let (patcher, key) = setup(vec![Row::new("x", 1)]);
    let token_b = patcher.apply_optimistic(&key, "temp-b", Row::new("temp-b", 2));
    let token_c = patcher.apply_optimistic(&key, "temp-c", Row::new("temp-c", 3));
    patcher.rollback(&token_b);
    patcher.cache().invalidate(&key);

    // Snapshot for temp-c holds [x, temp-b]; temp-b is resolved and must not come back
    assert_eq!(patcher.rollback(&token_c), RollbackOutcome::Restored);
    assert_eq!(ids(&patcher, &key), vec!["x"]);
  }

  #[test]
  fn test_commit_without_placeholder_is_noop() {
    let (patcher, key) = setup(vec![Row::new("x", 1)]);
    patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 2));
    patcher.cache().set(&key, CacheEntry::new(vec![Row::new("x", 1)]));

    assert!(!patcher.commit(&key, "temp-p", Row::new("srv-1", 2)));
    assert_eq!(ids(&patcher, &key), vec!["x"]);
    assert!(!patcher.is_live("temp-p"));
  }

  #[test]
  fn test_commit_after_refetch_drops_duplicate() {
    let (patcher, key) = setup(vec![]);
    patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 2));
    let mut entry = patcher.cache().get(&key).unwrap();
    entry.items_mut().insert(0, CacheItem::Confirmed(Row::new("srv-1", 2)));
    patcher.cache().set(&key, entry);

    assert!(patcher.commit(&key, "temp-p", Row::new("srv-1", 2)));
    assert_eq!(ids(&patcher, &key), vec!["srv-1"]);
  }

  #[test]
  fn test_reapply_keeps_single_placeholder() {
    let (patcher, key) = setup(vec![Row::new("x", 1)]);
    patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 1));
    patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 5));

    let entry = patcher.cache().get(&key).unwrap();
    assert_eq!(entry.placeholder_count("temp-p"), 1);
    assert_eq!(entry.records().last().map(|r| r.value), Some(5));
  }

  #[test]
  fn test_rollback_of_created_entry_removes_it() {
    let cache: Arc<dyn ReadCache<Row>> = Arc::new(MemoryCache::new());
    let patcher = OptimisticPatcher::new(cache);
    let key = QueryKey::new(["rows", "new"]);

    let token = patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 1));
    assert!(patcher.cache().get(&key).unwrap().fetched_at().is_none());

    patcher.rollback(&token);
    assert!(patcher.cache().get(&key).is_none());
  }

  #[test]
  fn test_duplicate_placeholders_clear_entry() {
    let (patcher, key) = setup(vec![Row::new("x", 1)]);
    let token = patcher.apply_optimistic(&key, "temp-p", Row::new("temp-p", 1));
    let mut entry = patcher.cache().get(&key).unwrap();
    entry.items_mut().push(CacheItem::Optimistic {
      local_id: "temp-p".to_string(),
      record: Row::new("temp-p", 1),
    });
    patcher.cache().set(&key, entry);

    assert_eq!(patcher.rollback(&token), RollbackOutcome::Cleared);
    assert!(patcher.cache().get(&key).is_none());
  }
}
