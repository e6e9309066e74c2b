//! The seams a [`Loader`](crate::loader::Loader) is plugged together from.
//!
//! A [`Fetcher`] produces raw bytes for a resource, a [`Resizer`] turns those bytes into a
//! decoded value, and a [`ResultSink`] receives the outcome of every request.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::caching::{CacheKey, LoadRequest, TargetSize};

/// The decoded result delivered to consumers. `None` signals a failed load.
pub type Payload<T> = Option<Arc<T>>;

/// Identifies a consumer that wants to be notified about a load.
///
/// A consumer is attached to at most one key at a time. Requesting a new key for the same
/// consumer detaches it from the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Errors produced while fetching the raw bytes of a resource.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The resource identity cannot be resolved by this fetcher.
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("failed to fetch resource")]
    Io(#[from] io::Error),
    #[error("failed to fetch resource: {0}")]
    Other(String),
}

/// Errors produced while decoding raw bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    /// Decoding would need more memory than is available.
    #[error("out of memory while decoding")]
    OutOfMemory,
}

/// Produces the raw bytes of a resource.
///
/// Fetchers are called from background workers and may block.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, request: &LoadRequest) -> Result<Vec<u8>, FetchError>;
}

/// Decodes raw bytes into the value handed to consumers.
pub trait Resizer: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn decode(&self, raw: &[u8], size: TargetSize) -> Result<Self::Output, DecodeError>;

    /// The weight of a decoded value in the in-memory cache, in bytes.
    fn weight(&self, output: &Self::Output) -> u32 {
        std::mem::size_of_val(output) as u32
    }
}

/// Receives notifications about requests.
///
/// Notifications are delivered from background workers, implementations that need them on a
/// particular thread have to forward them, see [`ChannelSink`](crate::adapters::ChannelSink).
/// Implementations must not block, and must not call back into the loader for the same consumer.
pub trait ResultSink<T>: Send + Sync + 'static {
    /// A consumer attached to a load that has not yet completed.
    fn on_loading(&self, key: &CacheKey, consumer: ConsumerId);

    /// The load for `key` completed. `result` is `None` when fetching or decoding failed.
    fn on_load_finished(&self, key: &CacheKey, consumer: ConsumerId, result: Payload<T>);

    /// The load for `key` was cancelled while `consumer` was still attached.
    fn on_load_cancelled(&self, key: &CacheKey, consumer: ConsumerId) {
        let _ = (key, consumer);
    }
}
