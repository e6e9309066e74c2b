use std::sync::Arc;

use moka::policy::EvictionPolicy;

use super::CacheKey;

/// A size-bounded, least-recently-used cache of decoded values.
///
/// The capacity is expressed in bytes, each entry is weighed by the closure given to
/// [`MemoryCache::new`] plus the length of its key.
pub struct MemoryCache<T> {
    cache: moka::sync::Cache<CacheKey, Arc<T>>,
}

impl<T> MemoryCache<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<W>(capacity: u64, weigher: W) -> Self
    where
        W: Fn(&T) -> u32 + Send + Sync + 'static,
    {
        let cache = moka::sync::Cache::builder()
            .name("memory")
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |key: &CacheKey, value: &Arc<T>| {
                (key.as_str().len() as u32).saturating_add(weigher(value.as_ref()))
            })
            .eviction_listener(|key, _, cause| {
                tracing::trace!(%key, ?cause, "evicted from memory cache");
            })
            .build();

        Self { cache }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        let value = self.cache.get(key);
        if value.is_some() {
            metric!(counter("caches.memory.hit") += 1);
        }
        value
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn insert(&self, key: CacheKey, value: Arc<T>) {
        self.cache.insert(key, value);
    }

    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// The summed weight of all entries, after applying pending evictions.
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}
