//! Two-tier cached resource loading.
//!
//! A [`Loader`](loader::Loader) resolves a keyed resource from an in-memory cache, then an on-disk
//! cache, and finally by fetching and decoding it on a background worker. At most one fetch is in
//! flight per key, and any number of consumers can attach to and detach from that fetch.
//!
//! See the [`caching`] module for how the cache layers fit together.

#[macro_use]
pub mod metrics;

pub mod adapters;
pub mod caching;
pub mod config;
pub mod executor;
pub mod interface;
pub mod lifecycle;
pub mod loader;
pub mod logging;
pub mod tasks;
pub mod utils;
