//! In-memory read cache with optimistic placeholders.
//!
//! This module provides:
//! - A keyed result-set cache (`ReadCache`) addressed by `QueryKey` tuples
//! - Optimistic insertion, commit and rollback of placeholders
//! - Read-through refetch that keeps still-pending placeholders
//! - Snapshot persistence of confirmed rows across restarts

mod layer;
mod memory;
mod patcher;
mod persist;
mod traits;

pub use layer::CacheLayer;
pub use memory::{MemoryCache, ReadCache};
pub use patcher::{OptimisticPatcher, RollbackOutcome, UndoToken};
pub use persist::{persist_snapshot, restore_snapshot, CACHE_STORAGE_KEY};
pub use traits::{CacheEntry, CacheItem, CacheResult, CacheSource, Cacheable, QueryKey};
