//! Core traits and types for the read cache.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Trait for records that can live in the read cache.
///
/// Implementors must provide a unique cache key and optionally an updated_at
/// timestamp.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier for this record (server id, or local id for a placeholder)
  fn cache_key(&self) -> String;

  /// Last modification timestamp.
  /// Returns None if the record doesn't track modification time.
  fn updated_at(&self) -> Option<DateTime<Utc>>;

  /// Record type name used in logs and snapshots (e.g., "habit_log")
  fn entity_type() -> &'static str;
}

/// Identifies one query result set: an ordered tuple of strings such as
/// `["habits", "habit-logs", "by-date", "2024-03-01"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
  pub fn new<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Extend this key with one more part.
  pub fn child(&self, part: impl Into<String>) -> Self {
    let mut parts = self.0.clone();
    parts.push(part.into());
    Self(parts)
  }

  pub fn parts(&self) -> &[String] {
    &self.0
  }

  /// True when `prefix` matches the leading parts of this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.0.join(", "))
  }
}

/// One slot of a cached result set.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheItem<T> {
  /// A record the remote service has confirmed
  Confirmed(T),
  /// A speculative record awaiting confirmation of the mutation `local_id`
  Optimistic { local_id: String, record: T },
}

impl<T> CacheItem<T> {
  pub fn record(&self) -> &T {
    match self {
      CacheItem::Confirmed(record) => record,
      CacheItem::Optimistic { record, .. } => record,
    }
  }

  pub fn local_id(&self) -> Option<&str> {
    match self {
      CacheItem::Confirmed(_) => None,
      CacheItem::Optimistic { local_id, .. } => Some(local_id),
    }
  }

  pub fn is_placeholder_for(&self, id: &str) -> bool {
    self.local_id() == Some(id)
  }
}

/// A keyed, versioned snapshot of one query's result set.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  items: Vec<CacheItem<T>>,
  /// Bumped on every local modification
  version: u64,
  /// When the confirmed rows were fetched, `None` for an entry that only
  /// exists because a placeholder was inserted
  fetched_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
  /// Create an entry from freshly fetched records.
  pub fn new(records: Vec<T>) -> Self {
    Self::with_fetched_at(records, Utc::now())
  }

  pub fn with_fetched_at(records: Vec<T>, fetched_at: DateTime<Utc>) -> Self {
    Self {
      items: records.into_iter().map(CacheItem::Confirmed).collect(),
      version: 0,
      fetched_at: Some(fetched_at),
    }
  }

  /// An empty entry that was never fetched.
  pub(crate) fn unfetched() -> Self {
    Self {
      items: Vec::new(),
      version: 0,
      fetched_at: None,
    }
  }

  pub(crate) fn from_items(
    items: Vec<CacheItem<T>>,
    version: u64,
    fetched_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      items,
      version,
      fetched_at,
    }
  }

  pub fn items(&self) -> &[CacheItem<T>] {
    &self.items
  }

  pub(crate) fn items_mut(&mut self) -> &mut Vec<CacheItem<T>> {
    &mut self.items
  }

  pub(crate) fn into_items(self) -> Vec<CacheItem<T>> {
    self.items
  }

  /// Records in display order, placeholders included.
  pub fn records(&self) -> impl Iterator<Item = &T> {
    self.items.iter().map(CacheItem::record)
  }

  /// Confirmed records only.
  pub fn confirmed(&self) -> impl Iterator<Item = &T> {
    self.items.iter().filter_map(|item| match item {
      CacheItem::Confirmed(record) => Some(record),
      CacheItem::Optimistic { .. } => None,
    })
  }

  pub fn version(&self) -> u64 {
    self.version
  }

  pub(crate) fn bump_version(&mut self) {
    self.version += 1;
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.fetched_at
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Position of the placeholder for `local_id`, if present.
  pub fn placeholder_position(&self, local_id: &str) -> Option<usize> {
    self.items.iter().position(|item| item.is_placeholder_for(local_id))
  }

  pub fn placeholder_count(&self, local_id: &str) -> usize {
    self
      .items
      .iter()
      .filter(|item| item.is_placeholder_for(local_id))
      .count()
  }

  pub fn has_placeholder(&self, local_id: &str) -> bool {
    self.placeholder_position(local_id).is_some()
  }
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network unavailable, serving stale cached data
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_query_key_prefix() {
    let all = QueryKey::new(["habits"]);
    let logs = all.child("habit-logs");
    let day = logs.child("by-date").child("2024-03-01");

    assert!(day.starts_with(&all));
    assert!(day.starts_with(&logs));
    assert!(!logs.starts_with(&day));
    assert!(!day.starts_with(&QueryKey::new(["goals"])));
    assert_eq!(day.to_string(), "[habits, habit-logs, by-date, 2024-03-01]");
  }

  #[test]
  fn test_query_key_serializes_as_tuple() {
    let key = QueryKey::new(["habits", "goals"]);
    assert_eq!(serde_json::to_string(&key).unwrap(), r#"["habits","goals"]"#);
  }

  #[test]
  fn test_entry_placeholder_lookup() {
    let entry = CacheEntry::from_items(
      vec![
        CacheItem::Confirmed(1),
        CacheItem::Optimistic {
          local_id: "temp-1".to_string(),
          record: 2,
        },
      ],
      0,
      Some(Utc::now()),
    );

    assert_eq!(entry.placeholder_position("temp-1"), Some(1));
    assert!(!entry.has_placeholder("temp-2"));
    assert_eq!(entry.records().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(entry.confirmed().copied().collect::<Vec<_>>(), vec![1]);
  }
}
