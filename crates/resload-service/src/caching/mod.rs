//! # Caching layers
//!
//! A request goes through the following steps:
//!
//! - First, it is looked up in the [`MemoryCache`] of decoded values, keyed by [`CacheKey`].
//!   A hit is delivered synchronously, without creating a load task.
//! - On miss, a load task is created (or joined, if one is already in flight for the key) and
//!   executed on a background worker. The task checks the memory cache once more.
//! - On miss, it tries the [`DiskCache`], which stores raw, undecoded bytes keyed by the
//!   resource identity. All target sizes of one resource share a single disk entry.
//! - On miss, it fetches the raw bytes through the configured fetcher.
//! - The raw bytes are decoded for the requested target size. Freshly fetched bytes are written
//!   to the disk cache, and the decoded value is inserted into the memory cache.
//!
//! ### Metrics
//!
//! - `caches.memory.hit`: Lookups served by the memory cache.
//! - `caches.disk.hit`: Reads served by the disk cache.
//! - `caches.disk.write`: Entries written to the disk cache.
//! - `caches.disk.evicted`: Entries evicted from the disk cache to stay within its size.
//!
//! ### Configuration
//!
//! The memory cache is always active, its capacity is set by
//! [`InMemoryCacheConfig::capacity`](crate::config::InMemoryCacheConfig::capacity).
//!
//! The disk cache is gated by [`Config::cache_dir`](crate::config::Config::cache_dir). Its size and
//! flush interval are set by [`DiskCacheConfig`](crate::config::DiskCacheConfig).

mod cache_key;
mod disk;
mod journal;
mod memory;

pub use cache_key::{CacheKey, LoadRequest, TargetSize, cache_file_name};
pub use disk::{DiskCache, InitState};
pub use journal::{DiskCacheError, Editor, JournalStore, Snapshot};
pub use memory::MemoryCache;
