//! Request-scoped cache.
//!
//! Holds data loaders and memoized scalar results for one logical unit of work. Every entry
//! records the tables it was read from; a change to any of them drops the entry.

mod loader;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

pub use loader::{DataLoader, bucket_size};

use crate::types::RowValues;

struct CachedLoader {
    tables: Vec<String>,
    loader: Arc<dyn Any + Send + Sync>,
}

struct CachedValue {
    tables: Vec<String>,
    value: RowValues,
}

#[derive(Default)]
struct CacheState {
    loaders: HashMap<String, CachedLoader>,
    values: HashMap<String, CachedValue>,
}

pub struct RequestCache {
    max_batch_size: usize,
    epoch: AtomicU64,
    state: Mutex<CacheState>,
}

impl RequestCache {
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            epoch: AtomicU64::new(0),
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Counter bumped by every invalidation. Read it before a query and pass it to
    /// [`memoize`](Self::memoize) so results that raced an invalidation are not stored.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The loader registered under `name`, created on first use.
    ///
    /// `tables` lists every table the loader reads; a change to any of them discards it.
    pub fn loader<K, V>(&self, name: &str, tables: &[&str]) -> Arc<DataLoader<K, V>>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if let Some(existing) = state.loaders.get(name)
            && let Ok(loader) = Arc::clone(&existing.loader).downcast::<DataLoader<K, V>>()
        {
            return loader;
        }
        let loader = Arc::new(DataLoader::new(self.max_batch_size));
        state.loaders.insert(
            name.to_owned(),
            CachedLoader {
                tables: tables.iter().map(|t| (*t).to_owned()).collect(),
                loader: Arc::clone(&loader) as Arc<dyn Any + Send + Sync>,
            },
        );
        loader
    }

    #[must_use]
    pub fn memoized(&self, key: &str) -> Option<RowValues> {
        self.lock().values.get(key).map(|cached| cached.value.clone())
    }

    /// Store `value` unless the cache was invalidated after `epoch` was read.
    pub fn memoize(&self, tables: &[&str], key: &str, value: RowValues, epoch: u64) -> bool {
        let mut state = self.lock();
        if self.epoch() != epoch {
            return false;
        }
        state.values.insert(
            key.to_owned(),
            CachedValue {
                tables: tables.iter().map(|t| (*t).to_owned()).collect(),
                value,
            },
        );
        true
    }

    /// Drop every entry that read from `table`.
    pub fn clear_table(&self, table: &str) {
        let mut state = self.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let reads = |tables: &[String]| tables.iter().any(|t| t == table);
        state.loaders.retain(|_, cached| !reads(&cached.tables));
        state.values.retain(|_, cached| !reads(&cached.tables));
        trace!(table, "request cache cleared for table");
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        state.loaders.clear();
        state.values.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.loaders.is_empty() && state.values.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestCache")
            .field("max_batch_size", &self.max_batch_size)
            .field("loaders", &state.loaders.len())
            .field("values", &state.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;

    #[test]
    fn loaders_are_shared_until_invalidated() {
        let cache = RequestCache::new(8);
        let a = cache.loader::<EntityId, String>("items:id", &["items"]);
        let b = cache.loader::<EntityId, String>("items:id", &["items"]);
        assert!(Arc::ptr_eq(&a, &b));

        cache.clear_table("tags");
        let c = cache.loader::<EntityId, String>("items:id", &["items"]);
        assert!(Arc::ptr_eq(&a, &c));

        cache.clear_table("items");
        let d = cache.loader::<EntityId, String>("items:id", &["items"]);
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn multi_table_entries_follow_each_table() {
        let cache = RequestCache::new(8);
        let epoch = cache.epoch();
        assert!(cache.memoize(&["item_tags", "tags"], "n", RowValues::Int(1), epoch));
        cache.clear_table("tags");
        assert_eq!(cache.memoized("n"), None);
    }

    #[test]
    fn stale_epoch_is_not_stored() {
        let cache = RequestCache::new(8);
        let epoch = cache.epoch();
        cache.clear_table("items");
        assert!(!cache.memoize(&["items"], "count", RowValues::Int(2), epoch));
        assert!(cache.is_empty());
    }
}
