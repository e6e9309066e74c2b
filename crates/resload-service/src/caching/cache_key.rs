use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The target dimensions a resource should be decoded for.
///
/// A zero width or height means "no constraint" on that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A request for one resource, decoded for one target size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadRequest {
    resource: Arc<str>,
    size: TargetSize,
}

impl LoadRequest {
    pub fn new(resource: impl Into<Arc<str>>, size: TargetSize) -> Self {
        Self {
            resource: resource.into(),
            size,
        }
    }

    /// The identity of the resource, as understood by the [`Fetcher`](crate::interface::Fetcher).
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn size(&self) -> TargetSize {
        self.size
    }
}

/// Identifies one decoded result.
///
/// Keys are compared by exact string equality, two requests for the same resource at different
/// target sizes yield different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Creates the key for the decoded result of `request`.
    pub fn for_request(request: &LoadRequest) -> Self {
        let TargetSize { width, height } = request.size();
        Self::new(format!("{}@{width}x{height}", request.resource()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maps an arbitrary key onto a file name that is safe to use inside the disk cache.
///
/// The name is the lowercase hex encoded sha-256 digest of the key.
pub fn cache_file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
