use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::cache_key::cache_file_name;
use super::journal::{DiskCacheError, JournalStore};
use crate::config::{Config, DiskCacheConfig};
use crate::executor::{ExecutorClosed, TaskExecutor};

/// Initialization progress of a [`DiskCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    NotStarted,
    /// Readers block until the state changes.
    Starting,
    Ready,
    /// Opening the store failed, the cache behaves as an always-empty cache.
    Failed,
}

struct Inner {
    state: InitState,
    /// Set while a thread opens the store with the lock released.
    opening: bool,
    store: Option<JournalStore>,
    last_flush: Option<Instant>,
}

/// A persistent, size-bounded cache of raw resource bytes.
///
/// Entries are stored in a [`JournalStore`] under the sha-256 of their key. Opening the store may
/// be slow, so it can happen in the background via [`DiskCache::init_async`]; reads issued in the
/// meantime block until it is done.
///
/// All failures are logged and turn into cache misses or skipped writes.
pub struct DiskCache {
    directory: PathBuf,
    max_size: u64,
    flush_interval: Duration,
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl DiskCache {
    pub fn new(directory: impl Into<PathBuf>, config: DiskCacheConfig) -> Self {
        Self {
            directory: directory.into(),
            max_size: config.max_size,
            flush_interval: config.flush_interval,
            inner: Mutex::new(Inner {
                state: InitState::NotStarted,
                opening: false,
                store: None,
                last_flush: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Creates the disk cache configured by `config`, if a cache directory is set.
    pub fn from_config(config: &Config) -> Option<Self> {
        let directory = config.cache_dir.as_ref()?;
        Some(Self::new(directory, config.disk_cache))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn state(&self) -> InitState {
        self.inner.lock().state
    }

    /// Summed size of all cached blobs, or `None` if the store is not open.
    pub fn size(&self) -> Option<u64> {
        self.inner.lock().store.as_ref().map(JournalStore::size)
    }

    /// Opens the backing store on the calling thread.
    ///
    /// Calling this while the store is open does nothing.
    pub fn init(&self) {
        let mut inner = self.inner.lock();
        self.init_locked(&mut inner);
    }

    /// Opens the backing store on `executor`.
    ///
    /// The cache counts as starting from now on. A read arriving before the executor got to the
    /// open performs it inline, a read arriving during the open blocks until it completed.
    pub fn init_async(self: &Arc<Self>, executor: &TaskExecutor) -> Result<(), ExecutorClosed> {
        {
            let mut inner = self.inner.lock();
            if inner.state != InitState::NotStarted {
                return Ok(());
            }
            inner.state = InitState::Starting;
        }

        let cache = Arc::clone(self);
        executor.execute(move || cache.init_scheduled()).inspect_err(|_| {
            let mut inner = self.inner.lock();
            inner.state = InitState::NotStarted;
            self.ready.notify_all();
        })
    }

    /// Reads the bytes stored for `key`.
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        self.wait_ready(&mut inner);
        let store = inner.store.as_mut()?;

        let result = store
            .get(&cache_file_name(key))
            .and_then(|snapshot| Ok(snapshot.map(|s| s.into_bytes()).transpose()?));
        match result {
            Ok(Some(bytes)) => {
                metric!(counter("caches.disk.hit") += 1);
                Some(bytes)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    key,
                    "failed to read from disk cache"
                );
                None
            }
        }
    }

    /// Stores `bytes` under `key`, returning whether they were written.
    ///
    /// Nothing is written if the key is already present or the store is unavailable.
    pub fn write(&self, key: &str, bytes: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        self.wait_ready(&mut inner);
        let Some(store) = inner.store.as_mut() else {
            return false;
        };

        let name = cache_file_name(key);
        if store.contains(&name) {
            tracing::trace!(key, "already in disk cache");
            return false;
        }

        match write_entry(store, &name, bytes) {
            Ok(size) => {
                metric!(counter("caches.disk.write") += 1);
                tracing::trace!(key, size, "wrote to disk cache");
                true
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    key,
                    "failed to write to disk cache"
                );
                false
            }
        }
    }

    /// Deletes everything in the cache and reopens an empty store.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        while inner.opening {
            self.ready.wait(&mut inner);
        }
        let result = match inner.store.take() {
            Some(store) => store.delete(),
            None => remove_dir_all_if_exists(&self.directory).map_err(DiskCacheError::from),
        };
        if let Err(e) = result {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "failed to clear disk cache"
            );
        }
        inner.state = InitState::NotStarted;
        self.init_locked(&mut inner);
    }

    /// Flushes the journal, unless the previous flush happened within the flush interval.
    ///
    /// Returns whether a flush was attempted.
    pub fn flush(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner
            .last_flush
            .is_some_and(|last| now.duration_since(last) < self.flush_interval)
        {
            return false;
        }
        inner.last_flush = Some(now);

        if let Some(store) = inner.store.as_mut() {
            if let Err(e) = store.flush() {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to flush disk cache"
                );
            }
        }
        true
    }

    /// Releases the store. Further reads and writes are no-ops until the next [`DiskCache::init`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        while inner.opening {
            self.ready.wait(&mut inner);
        }
        if inner.state == InitState::Starting {
            // the scheduled open has not started yet and will find nothing to do
            inner.state = InitState::Ready;
            self.ready.notify_all();
        }
        if let Some(mut store) = inner.store.take() {
            if let Err(e) = store.close() {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to close disk cache"
                );
            }
        }
    }

    pub fn flush_async(self: &Arc<Self>, executor: &TaskExecutor) -> Result<(), ExecutorClosed> {
        let cache = Arc::clone(self);
        executor.execute(move || {
            cache.flush();
        })
    }

    pub fn close_async(self: &Arc<Self>, executor: &TaskExecutor) -> Result<(), ExecutorClosed> {
        let cache = Arc::clone(self);
        executor.execute(move || cache.close())
    }

    /// The job queued by [`DiskCache::init_async`].
    fn init_scheduled(&self) {
        let mut inner = self.inner.lock();
        while inner.opening {
            self.ready.wait(&mut inner);
        }
        if inner.state == InitState::Starting {
            self.init_locked(&mut inner);
        }
    }

    fn wait_ready(&self, inner: &mut MutexGuard<'_, Inner>) {
        while inner.opening {
            self.ready.wait(inner);
        }
        if matches!(inner.state, InitState::NotStarted | InitState::Starting) {
            self.init_locked(inner);
        }
    }

    fn init_locked(&self, inner: &mut MutexGuard<'_, Inner>) {
        while inner.opening {
            self.ready.wait(inner);
        }
        if inner.store.as_ref().is_some_and(|store| !store.is_closed()) {
            inner.state = InitState::Ready;
            self.ready.notify_all();
            return;
        }

        inner.state = InitState::Starting;
        inner.opening = true;
        let store = MutexGuard::unlocked(inner, || self.open_store());
        inner.opening = false;
        inner.state = match store {
            Some(_) => InitState::Ready,
            None => InitState::Failed,
        };
        inner.store = store;
        self.ready.notify_all();
    }

    fn open_store(&self) -> Option<JournalStore> {
        if let Err(e) = fs::create_dir_all(&self.directory) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                directory = %self.directory.display(),
                "failed to create disk cache directory"
            );
            return None;
        }

        match fs2::available_space(&self.directory) {
            Ok(available) if available > self.max_size => {}
            Ok(available) => {
                tracing::error!(
                    available,
                    required = self.max_size,
                    directory = %self.directory.display(),
                    "not enough free space for disk cache"
                );
                return None;
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to query free space for disk cache"
                );
                return None;
            }
        }

        match JournalStore::open(&self.directory, self.max_size) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    directory = %self.directory.display(),
                    "failed to open disk cache"
                );
                None
            }
        }
    }
}

fn write_entry(store: &mut JournalStore, name: &str, bytes: &[u8]) -> Result<u64, DiskCacheError> {
    let mut editor = store.edit(name)?;
    if let Err(e) = editor.write_all(bytes) {
        store.abort(editor)?;
        return Err(e.into());
    }
    store.commit(editor)
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
