//! Helpers for testing the loader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The disk cache recreates its directory lazily, so dropping the
//!    handle too early silently leaks the directory.
//!
//!  - Notifications are delivered from worker threads. Use [`RecordingSink::wait_for_terminal`]
//!    and [`wait_until`] instead of sleeping for a fixed amount of time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use resload_service::caching::{CacheKey, LoadRequest, TargetSize};
use resload_service::interface::{ConsumerId, FetchError, Fetcher, Payload, ResultSink};

pub use tempfile::TempDir;

/// How long the helpers wait for background work before giving up.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resload` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resload_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Creates a request for `resource` without size constraints.
pub fn request(resource: &str) -> LoadRequest {
    LoadRequest::new(resource, TargetSize::default())
}

/// Polls `condition` until it holds, returning `false` on timeout.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

/// A notification captured by a [`RecordingSink`].
#[derive(Debug)]
pub enum Event<T> {
    Loading(CacheKey, ConsumerId),
    Finished(CacheKey, ConsumerId, Payload<T>),
    Cancelled(CacheKey, ConsumerId),
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Event::Loading(key, consumer) => Event::Loading(key.clone(), *consumer),
            Event::Finished(key, consumer, payload) => {
                Event::Finished(key.clone(), *consumer, payload.clone())
            }
            Event::Cancelled(key, consumer) => Event::Cancelled(key.clone(), *consumer),
        }
    }
}

impl<T> Event<T> {
    pub fn consumer(&self) -> ConsumerId {
        match self {
            Event::Loading(_, consumer)
            | Event::Finished(_, consumer, _)
            | Event::Cancelled(_, consumer) => *consumer,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Loading(..))
    }
}

/// A [`ResultSink`] that records every notification in order.
pub struct RecordingSink<T> {
    events: Mutex<Vec<Event<T>>>,
    changed: Condvar,
}

impl<T> Default for RecordingSink<T> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }
}

impl<T> RecordingSink<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: Event<T>) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<Event<T>> {
        self.events.lock().clone()
    }

    /// All finish and cancel notifications.
    pub fn terminal(&self) -> Vec<Event<T>> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.is_terminal())
            .cloned()
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.is_terminal())
            .count()
    }

    /// The finished notifications delivered to `consumer`.
    pub fn finished_for(&self, consumer: ConsumerId) -> Vec<Payload<T>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Finished(_, c, payload) if *c == consumer => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Blocks until at least `count` terminal notifications were recorded.
    pub fn wait_for_terminal(&self, count: usize) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        while events.iter().filter(|event| event.is_terminal()).count() < count {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return false;
            }
        }
        true
    }
}

impl<T: Send + Sync + 'static> ResultSink<T> for RecordingSink<T> {
    fn on_loading(&self, key: &CacheKey, consumer: ConsumerId) {
        self.record(Event::Loading(key.clone(), consumer));
    }

    fn on_load_finished(&self, key: &CacheKey, consumer: ConsumerId, result: Payload<T>) {
        self.record(Event::Finished(key.clone(), consumer, result));
    }

    fn on_load_cancelled(&self, key: &CacheKey, consumer: ConsumerId) {
        self.record(Event::Cancelled(key.clone(), consumer));
    }
}

/// A latch that blocks fetches until it is opened.
#[derive(Default)]
struct Latch {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Latch {
    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    fn set(&self, value: bool) {
        *self.open.lock() = value;
        self.opened.notify_all();
    }
}

/// A [`Fetcher`] serving bytes from a map, with knobs to block, fail, or panic.
///
/// Every resource that is not explicitly configured resolves to its own name as bytes.
pub struct ScriptedFetcher {
    resources: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    called: Condvar,
    latch: Latch,
}

impl ScriptedFetcher {
    /// A fetcher that answers right away.
    pub fn new() -> Arc<Self> {
        let fetcher = Self {
            resources: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            called: Condvar::new(),
            latch: Latch::default(),
        };
        fetcher.latch.set(true);
        Arc::new(fetcher)
    }

    /// A fetcher that blocks every fetch until [`ScriptedFetcher::release`] is called.
    pub fn blocked() -> Arc<Self> {
        let fetcher = Self::new();
        fetcher.latch.set(false);
        fetcher
    }

    pub fn insert(&self, resource: &str, bytes: impl Into<Vec<u8>>) {
        self.resources
            .lock()
            .insert(resource.to_owned(), bytes.into());
    }

    pub fn fail(&self, resource: &str) {
        self.failing.lock().insert(resource.to_owned());
    }

    pub fn panic_on(&self, resource: &str) {
        self.panicking.lock().insert(resource.to_owned());
    }

    /// Lets all blocked and future fetches through.
    pub fn release(&self) {
        self.latch.set(true);
    }

    /// Number of fetches started for `resource`.
    pub fn calls(&self, resource: &str) -> usize {
        self.calls.lock().get(resource).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Blocks until at least `count` fetches were started in total.
    pub fn wait_for_calls(&self, count: usize) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        let mut calls = self.calls.lock();
        while calls.values().sum::<usize>() < count {
            if self.called.wait_until(&mut calls, deadline).timed_out() {
                return false;
            }
        }
        true
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: &LoadRequest) -> Result<Vec<u8>, FetchError> {
        let resource = request.resource();
        *self.calls.lock().entry(resource.to_owned()).or_default() += 1;
        self.called.notify_all();

        self.latch.wait();

        if self.panicking.lock().contains(resource) {
            panic!("scripted panic for {resource}");
        }
        if self.failing.lock().contains(resource) {
            return Err(FetchError::NotFound(resource.to_owned()));
        }
        Ok(self
            .resources
            .lock()
            .get(resource)
            .cloned()
            .unwrap_or_else(|| resource.as_bytes().to_vec()))
    }
}
