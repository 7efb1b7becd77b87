//! Persisting the read cache across restarts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::memory::ReadCache;
use super::traits::{CacheEntry, Cacheable, QueryKey};
use crate::error::Result;
use crate::store::KeyValueStore;

/// Storage key holding the serialized snapshot.
pub const CACHE_STORAGE_KEY: &str = "@query_cache";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQuery<T> {
  query_key: QueryKey,
  records: Vec<T>,
  fetched_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache<T> {
  queries: Vec<PersistedQuery<T>>,
  timestamp: DateTime<Utc>,
}

/// Keys that may carry credentials are never written to disk.
fn is_sensitive(key: &QueryKey) -> bool {
  key.parts().iter().any(|part| part.contains("session"))
}

/// Write the confirmed rows of the most recently fetched entries.
///
/// Placeholders are left out; they are re-applied from the mutation queue at
/// start-up. Returns the number of entries written.
pub async fn persist_snapshot<T, S>(cache: &dyn ReadCache<T>, store: &S, max_entries: usize) -> Result<usize>
where
  T: Cacheable,
  S: KeyValueStore,
{
  let mut queries: Vec<PersistedQuery<T>> = cache
    .entries()
    .into_iter()
    .filter(|(key, _)| !is_sensitive(key))
    .filter_map(|(query_key, entry)| {
      let fetched_at = entry.fetched_at()?;
      Some(PersistedQuery {
        query_key,
        records: entry.confirmed().cloned().collect(),
        fetched_at,
      })
    })
    .collect();

  queries.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
  queries.truncate(max_entries);

  let count = queries.len();
  let snapshot = PersistedCache {
    queries,
    timestamp: Utc::now(),
  };
  store
    .set(CACHE_STORAGE_KEY, &serde_json::to_string(&snapshot)?)
    .await?;

  debug!(count, entity = T::entity_type(), "persisted query cache");
  Ok(count)
}

/// Load entries younger than `max_age` into the cache.
///
/// Entries already present in the cache win over the snapshot. An
/// unreadable snapshot is discarded. Returns the number of entries loaded.
pub async fn restore_snapshot<T, S>(cache: &dyn ReadCache<T>, store: &S, max_age: Duration) -> Result<usize>
where
  T: Cacheable,
  S: KeyValueStore,
{
  let Some(raw) = store.get(CACHE_STORAGE_KEY).await? else {
    return Ok(0);
  };

  let snapshot: PersistedCache<T> = match serde_json::from_str(&raw) {
    Ok(snapshot) => snapshot,
    Err(e) => {
      warn!(error = %e, "failed to parse persisted query cache, discarding it");
      store.remove(CACHE_STORAGE_KEY).await?;
      return Ok(0);
    }
  };

  let now = Utc::now();
  let mut restored = 0;
  for query in snapshot.queries {
    if now - query.fetched_at >= max_age || cache.get(&query.query_key).is_some() {
      continue;
    }
    cache.set(
      &query.query_key,
      CacheEntry::with_fetched_at(query.records, query.fetched_at),
    );
    restored += 1;
  }

  debug!(restored, "restored query cache");
  Ok(restored)
}
