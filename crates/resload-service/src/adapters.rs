//! Ready-made implementations of the [`interface`](crate::interface) traits.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};

use crate::caching::{CacheKey, LoadRequest, TargetSize};
use crate::interface::{ConsumerId, DecodeError, FetchError, Fetcher, Payload, Resizer, ResultSink};

/// Fetches resources from files below a root directory.
///
/// The resource identity is interpreted as a relative path. Absolute paths and paths leaving
/// the root are rejected.
#[derive(Debug, Clone)]
pub struct FilesystemFetcher {
    root: PathBuf,
}

impl FilesystemFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, resource: &str) -> Result<PathBuf, FetchError> {
        let relative = Path::new(resource);
        let is_contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if resource.is_empty() || !is_contained {
            return Err(FetchError::InvalidResource(resource.to_owned()));
        }
        Ok(self.root.join(relative))
    }
}

impl Fetcher for FilesystemFetcher {
    fn fetch(&self, request: &LoadRequest) -> Result<Vec<u8>, FetchError> {
        let path = self.resolve(request.resource())?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(request.resource().to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Hands the raw bytes through unchanged, ignoring the target size.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughResizer {
    limit: Option<usize>,
}

impl PassthroughResizer {
    pub fn new() -> Self {
        Self { limit: None }
    }

    /// Rejects payloads larger than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }
}

impl Default for PassthroughResizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Resizer for PassthroughResizer {
    type Output = Vec<u8>;

    fn decode(&self, raw: &[u8], _size: TargetSize) -> Result<Vec<u8>, DecodeError> {
        match self.limit {
            Some(limit) if raw.len() > limit => Err(DecodeError::TooLarge {
                size: raw.len(),
                limit,
            }),
            _ => Ok(raw.to_vec()),
        }
    }

    fn weight(&self, output: &Vec<u8>) -> u32 {
        output.len().try_into().unwrap_or(u32::MAX)
    }
}

/// Logs every notification and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl<T: Send + Sync + 'static> ResultSink<T> for LoggingSink {
    fn on_loading(&self, key: &CacheKey, consumer: ConsumerId) {
        tracing::debug!(%key, %consumer, "loading");
    }

    fn on_load_finished(&self, key: &CacheKey, consumer: ConsumerId, result: Payload<T>) {
        tracing::debug!(%key, %consumer, success = result.is_some(), "load finished");
    }

    fn on_load_cancelled(&self, key: &CacheKey, consumer: ConsumerId) {
        tracing::debug!(%key, %consumer, "load cancelled");
    }
}

/// A notification forwarded by a [`ChannelSink`].
#[derive(Debug)]
pub enum Notification<T> {
    Loading {
        key: CacheKey,
        consumer: ConsumerId,
    },
    Finished {
        key: CacheKey,
        consumer: ConsumerId,
        result: Payload<T>,
    },
    Cancelled {
        key: CacheKey,
        consumer: ConsumerId,
    },
}

impl<T> Notification<T> {
    pub fn consumer(&self) -> ConsumerId {
        match self {
            Notification::Loading { consumer, .. }
            | Notification::Finished { consumer, .. }
            | Notification::Cancelled { consumer, .. } => *consumer,
        }
    }

    /// Whether this is the last notification for a request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Loading { .. })
    }
}

/// Forwards notifications over a channel, so the owning thread can handle them in its own loop.
#[derive(Debug)]
pub struct ChannelSink<T> {
    sender: Sender<Notification<T>>,
}

impl<T> ChannelSink<T> {
    pub fn new() -> (Self, Receiver<Notification<T>>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, notification: Notification<T>) {
        // the owner went away, nobody is interested anymore
        if self.sender.send(notification).is_err() {
            tracing::trace!("notification receiver dropped");
        }
    }
}

impl<T: Send + Sync + 'static> ResultSink<T> for ChannelSink<T> {
    fn on_loading(&self, key: &CacheKey, consumer: ConsumerId) {
        self.send(Notification::Loading {
            key: key.clone(),
            consumer,
        });
    }

    fn on_load_finished(&self, key: &CacheKey, consumer: ConsumerId, result: Payload<T>) {
        self.send(Notification::Finished {
            key: key.clone(),
            consumer,
            result,
        });
    }

    fn on_load_cancelled(&self, key: &CacheKey, consumer: ConsumerId) {
        self.send(Notification::Cancelled {
            key: key.clone(),
            consumer,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn request(resource: &str) -> LoadRequest {
        LoadRequest::new(resource, TargetSize::default())
    }

    #[test]
    fn test_filesystem_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();
        fs::write(dir.path().join("photos/cat.png"), b"meow").unwrap();
        let fetcher = FilesystemFetcher::new(dir.path());

        assert_eq!(fetcher.fetch(&request("photos/cat.png")).unwrap(), b"meow");
        assert!(matches!(
            fetcher.fetch(&request("photos/dog.png")),
            Err(FetchError::NotFound(_))
        ));
    }

    #[test]
    fn test_filesystem_fetcher_stays_in_root() {
        let fetcher = FilesystemFetcher::new("/srv/resources");
        for resource in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                fetcher.fetch(&request(resource)),
                Err(FetchError::InvalidResource(_))
            ));
        }
    }

    #[test]
    fn test_passthrough_limit() {
        let resizer = PassthroughResizer::with_limit(4);
        assert_eq!(resizer.decode(b"1234", TargetSize::default()).unwrap(), b"1234");
        assert!(matches!(
            resizer.decode(b"12345", TargetSize::default()),
            Err(DecodeError::TooLarge { size: 5, limit: 4 })
        ));
        assert_eq!(resizer.weight(&vec![0; 10]), 10);
    }

    #[test]
    fn test_channel_sink() {
        let (sink, receiver) = ChannelSink::<Vec<u8>>::new();
        let key = CacheKey::new("k");
        sink.on_loading(&key, ConsumerId(1));
        sink.on_load_finished(&key, ConsumerId(1), Some(Arc::new(vec![1])));

        let loading = receiver.try_recv().unwrap();
        assert!(!loading.is_terminal());
        let finished = receiver.try_recv().unwrap();
        assert!(finished.is_terminal());
        assert_eq!(finished.consumer(), ConsumerId(1));
        assert!(receiver.try_recv().is_err());
    }
}
