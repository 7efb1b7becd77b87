//! Durable key-value storage surface.
//!
//! The queue and the cache snapshot only need whole-value reads and writes
//! of serialized strings, so backends stay interchangeable.

mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, SyncError};

pub use sqlite::SqliteStore;

/// Asynchronous key-value storage.
///
/// Every call is a suspension point from the caller's point of view, so
/// callers must not hold a value read before an `.await` and write it back
/// afterwards without re-reading.
#[allow(async_fn_in_trait)]
pub trait KeyValueStore {
  /// Read a value, `None` when the key was never written or was removed.
  async fn get(&self, key: &str) -> Result<Option<String>>;

  /// Overwrite the value stored under `key`.
  async fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Remove a key. Removing a missing key is not an error.
  async fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self
      .values
      .lock()
      .map_err(|e| SyncError::persistence(format!("Lock poisoned: {}", e)))?;
    Ok(values.get(key).cloned())
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| SyncError::persistence(format!("Lock poisoned: {}", e)))?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| SyncError::persistence(format!("Lock poisoned: {}", e)))?;
    values.remove(key);
    Ok(())
  }
}

impl<S: KeyValueStore> KeyValueStore for std::sync::Arc<S> {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    (**self).get(key).await
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    (**self).set(key, value).await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    (**self).remove(key).await
  }
}

/// Memory store whose writes can be switched off to simulate a full disk.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStore {
  inner: MemoryStore,
  fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
  pub(crate) fn set_fail_writes(&self, fail: bool) {
    self
      .fail_writes
      .store(fail, std::sync::atomic::Ordering::SeqCst);
  }

  fn check(&self) -> Result<()> {
    if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(SyncError::persistence("quota exceeded"));
    }
    Ok(())
  }
}

#[cfg(test)]
impl KeyValueStore for FailingStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    self.inner.get(key).await
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    self.check()?;
    self.inner.set(key, value).await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.check()?;
    self.inner.remove(key).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_memory_store_roundtrip() {
    let store = MemoryStore::new();
    assert_eq!(store.get("k").await.unwrap(), None);

    store.set("k", "v1").await.unwrap();
    store.set("k", "v2").await.unwrap();
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

    store.remove("k").await.unwrap();
    store.remove("k").await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_failing_store_rejects_writes_only() {
    let store = FailingStore::default();
    store.set("k", "v").await.unwrap();
    store.set_fail_writes(true);

    assert!(matches!(
      store.set("k", "other").await,
      Err(SyncError::Persistence { .. })
    ));
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
  }
}
