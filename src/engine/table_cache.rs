use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::utils::types::Table;

/// Bounded, thread-safe map from source key to a shared table
///
/// `get` marks an entry as most recently used. Inserting a new key into a
/// full cache evicts the least recently used entry first; overwriting an
/// existing key never evicts anything. The lock is never held across I/O.
pub struct TableCache {
    entries: Mutex<LruCache<String, Arc<Table>>>,
    capacity: usize,
}

impl TableCache {
    /// Create a cache holding at most `capacity` tables (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
        }
    }

    // Entries are plain values, so a panic elsewhere cannot leave the map inconsistent
    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<Table>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a table, refreshing its recency
    pub fn get(&self, key: &str) -> Option<Arc<Table>> {
        let hit = self.lock().get(key).cloned();
        debug!(key, hit = hit.is_some(), "Table cache lookup");
        hit
    }

    /// Insert or replace a table
    pub fn set(&self, key: impl Into<String>, table: Arc<Table>) {
        let key = key.into();
        let mut entries = self.lock();
        if entries.contains(&key) {
            entries.put(key, table);
            return;
        }
        if entries.len() >= self.capacity {
            if let Some((evicted, _)) = entries.pop_lru() {
                debug!(key = %evicted, "Evicted least recently used table");
            }
        }
        entries.put(key, table);
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.lock().pop(key).is_some();
        if removed {
            debug!(key, "Table cache entry invalidated");
        }
        removed
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Membership test that does not touch recency
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        self.lock().iter().map(|(key, _)| key.clone()).collect()
    }
}

impl Default for TableCache {
    fn default() -> Self {
        Self::new(50)
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{Column, Value};
    use std::thread;

    fn table(n: i64) -> Arc<Table> {
        Arc::new(Table::new(vec![Column::new("n", vec![Value::Integer(n)])]).unwrap())
    }

    #[test]
    fn test_set_get_invalidate() {
        let cache = TableCache::new(2);
        cache.set("k", table(1));

        assert_eq!(cache.get("k"), Some(table(1)));
        assert!(cache.invalidate("k"));
        assert_eq!(cache.get("k"), None);
        assert!(!cache.invalidate("k"));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = TableCache::new(2);
        cache.set("a", table(1));
        cache.set("b", table(2));
        assert!(cache.get("a").is_some());

        cache.set("c", table(3));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = TableCache::new(2);
        cache.set("a", table(1));
        cache.set("b", table(2));

        cache.set("a", table(10));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(table(10)));
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_clear_and_capacity() {
        let cache = TableCache::new(0);
        assert_eq!(cache.capacity(), 1);

        cache.set("a", table(1));
        cache.set("b", table(2));
        assert_eq!(cache.keys(), vec!["b".to_string()]);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access_stays_bounded() {
        let cache = Arc::new(TableCache::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("{}-{}", t, i % 12);
                        cache.set(key.clone(), table(i));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_recovers_from_poisoned_lock() {
        let cache = Arc::new(TableCache::new(2));
        cache.set("a", table(1));

        let poisoner = cache.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(cache.get("a").is_some());
    }
}
