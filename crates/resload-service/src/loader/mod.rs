//! The consumer-facing loader.
//!
//! [`Loader::request`] answers from the memory cache right away when it can. Otherwise the
//! consumer is attached to the load task for the key, creating and submitting that task if
//! none is in flight. Workers then run the task through the cache layers described in
//! [`caching`](crate::caching), and notify every attached consumer through the [`ResultSink`].
//!
//! ### Metrics
//!
//! - `loader.request`: Requests, tagged by `outcome` (`memory`, `completed`, `started`, `joined`).
//! - `tasks.finished`, `tasks.cancelled`, `tasks.stalled`: Tasks reaching these states.
//! - `fetch.failed`, `decode.failed`: Failures while loading.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::caching::{CacheKey, DiskCache, LoadRequest, MemoryCache};
use crate::config::Config;
use crate::executor::{ExecutorClosed, TaskExecutor, TaskOrder};
use crate::interface::{ConsumerId, Fetcher, Resizer, ResultSink};
use crate::lifecycle::{LifecycleState, Phase};
use crate::tasks::{
    Abandon, Attach, Detach, LoadTask, Loaded, TaskOutcome, TaskRegistry, TaskState, Terminated,
};
use crate::utils::defer::defer;

mod pipeline;

use pipeline::Pipeline;

/// Errors returned when submitting requests.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    #[error("loader was destroyed")]
    Destroyed,
    #[error(transparent)]
    Executor(#[from] ExecutorClosed),
}

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Served from the memory cache, the consumer was notified synchronously.
    Cached,
    /// The task for the key had just finished, the consumer was notified synchronously.
    Completed,
    /// A new task was submitted for the key.
    Started,
    /// The consumer joined a task that was already in flight.
    Joined,
}

struct Shared<T> {
    registry: TaskRegistry<T>,
    lifecycle: Arc<LifecycleState>,
    executor: Arc<TaskExecutor>,
    pipeline: Pipeline<T>,
    sink: Arc<dyn ResultSink<T>>,
    bindings: Mutex<HashMap<ConsumerId, CacheKey>>,
    destroyed: AtomicBool,
}

/// Loads keyed resources through the memory cache, the disk cache, and the fetcher.
///
/// Cloning a loader is cheap and yields a handle to the same loader. Dropping the last handle
/// destroys the loader, see [`Loader::destroy`].
pub struct Loader<T: 'static> {
    shared: Arc<Shared<T>>,
    _handle: Arc<Handle<T>>,
}

impl<T: 'static> Clone for Loader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _handle: Arc::clone(&self._handle),
        }
    }
}

/// Shared by all [`Loader`] handles, but not by queued jobs.
struct Handle<T: 'static>(Arc<Shared<T>>);

impl<T: 'static> Drop for Handle<T> {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

/// Configures and creates a [`Loader`].
pub struct LoaderBuilder<T> {
    fetcher: Arc<dyn Fetcher>,
    resizer: Arc<dyn Resizer<Output = T>>,
    sink: Arc<dyn ResultSink<T>>,
    memory_capacity: u64,
    disk: Option<Arc<DiskCache>>,
    executor: Option<Arc<TaskExecutor>>,
    workers: usize,
    order: TaskOrder,
}

impl<T> LoaderBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Capacity of the memory cache, in bytes as reported by [`Resizer::weight`].
    pub fn memory_capacity(mut self, capacity: u64) -> Self {
        self.memory_capacity = capacity;
        self
    }

    /// Puts `disk` between the memory cache and the fetcher.
    ///
    /// The disk cache is initialized in the background when the loader is built.
    pub fn disk_cache(mut self, disk: Arc<DiskCache>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Runs tasks on `executor` instead of a dedicated one.
    pub fn executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn task_order(mut self, order: TaskOrder) -> Self {
        self.order = order;
        self
    }

    pub fn build(self) -> io::Result<Loader<T>> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(TaskExecutor::new(self.workers, self.order)?),
        };

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.init_async(&executor) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to schedule disk cache initialization"
                );
            }
        }

        let resizer = Arc::clone(&self.resizer);
        let memory = MemoryCache::new(self.memory_capacity, move |value: &T| {
            resizer.weight(value)
        });
        let lifecycle = Arc::new(LifecycleState::new());

        let shared = Shared {
            registry: TaskRegistry::new(),
            lifecycle: Arc::clone(&lifecycle),
            executor,
            pipeline: Pipeline {
                memory,
                disk: self.disk,
                fetcher: self.fetcher,
                resizer: self.resizer,
                lifecycle,
            },
            sink: self.sink,
            bindings: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        };

        let shared = Arc::new(shared);
        Ok(Loader {
            _handle: Arc::new(Handle(Arc::clone(&shared))),
            shared,
        })
    }
}

impl<T> Loader<T>
where
    T: Send + Sync + 'static,
{
    pub fn builder<F, R, S>(fetcher: Arc<F>, resizer: Arc<R>, sink: Arc<S>) -> LoaderBuilder<T>
    where
        F: Fetcher,
        R: Resizer<Output = T>,
        S: ResultSink<T>,
    {
        LoaderBuilder {
            fetcher,
            resizer,
            sink,
            memory_capacity: crate::config::InMemoryCacheConfig::default().capacity,
            disk: None,
            executor: None,
            workers: 4,
            order: TaskOrder::default(),
        }
    }

    /// Creates a loader with the caches, workers, and task order set in `config`.
    pub fn from_config<F, R, S>(
        config: &Config,
        fetcher: Arc<F>,
        resizer: Arc<R>,
        sink: Arc<S>,
    ) -> io::Result<Self>
    where
        F: Fetcher,
        R: Resizer<Output = T>,
        S: ResultSink<T>,
    {
        let mut builder = Self::builder(fetcher, resizer, sink)
            .memory_capacity(config.in_memory.capacity)
            .workers(config.workers)
            .task_order(config.task_order);
        if let Some(disk) = DiskCache::from_config(config) {
            builder = builder.disk_cache(Arc::new(disk));
        }
        builder.build()
    }

    /// Requests the resource described by `request` on behalf of `consumer`.
    ///
    /// A consumer waits for one key at a time. If it was attached to a different key before, it
    /// is detached from that key first, which may cancel the load for it.
    pub fn request(
        &self,
        consumer: ConsumerId,
        request: LoadRequest,
    ) -> Result<RequestStatus, LoaderError> {
        let shared = &self.shared;
        shared.ensure_alive()?;

        if self.query_cache(consumer, &request) {
            return Ok(RequestStatus::Cached);
        }

        if shared.executor.is_shut_down() {
            return Err(ExecutorClosed.into());
        }

        let key = CacheKey::for_request(&request);
        let previous = shared.bindings.lock().insert(consumer, key.clone());
        if let Some(previous) = previous.filter(|previous| *previous != key) {
            shared.detach(consumer, &previous);
        }

        let mut announced = false;
        loop {
            let (task, created) = shared.registry.find_or_create(&key, || {
                LoadTask::new(key.clone(), request.clone(), false)
            });

            // a worker may deliver the result as soon as the consumer is attached
            if !announced && !task.is_attached(consumer) {
                shared.sink.on_loading(&key, consumer);
                announced = true;
            }

            match task.attach(consumer) {
                Attach::Attached | Attach::AlreadyAttached => {
                    if created {
                        shared.submit(&task).inspect_err(|_| shared.unbind(consumer))?;
                        metric!(counter("loader.request") += 1, "outcome" => "started");
                        return Ok(RequestStatus::Started);
                    }
                    if task.state() == TaskState::Stalled
                        && !shared.lifecycle.exit_early()
                        && task.restart()
                    {
                        shared.submit(&task).inspect_err(|_| shared.unbind(consumer))?;
                    }
                    metric!(counter("loader.request") += 1, "outcome" => "joined");
                    return Ok(RequestStatus::Joined);
                }
                Attach::Finished(payload) => {
                    shared.forget_binding(consumer, &key);
                    metric!(counter("loader.request") += 1, "outcome" => "completed");
                    shared.sink.on_load_finished(&key, consumer, payload);
                    return Ok(RequestStatus::Completed);
                }
                Attach::Cancelled => {
                    shared.registry.remove(&task);
                }
            }
        }
    }

    /// Delivers the decoded value for `request` synchronously, if it is in the memory cache.
    ///
    /// On a hit, `consumer` is detached from whatever it was waiting for before.
    pub fn query_cache(&self, consumer: ConsumerId, request: &LoadRequest) -> bool {
        let shared = &self.shared;
        if shared.destroyed.load(Ordering::SeqCst) {
            return false;
        }

        let key = CacheKey::for_request(request);
        let Some(value) = shared.pipeline.memory.get(&key) else {
            return false;
        };

        shared.unbind(consumer);
        metric!(counter("loader.request") += 1, "outcome" => "memory");
        shared.sink.on_load_finished(&key, consumer, Some(value));
        true
    }

    /// Loads `requests` into the caches without any consumer.
    ///
    /// Returns the number of tasks that were started. Keys that are cached in memory or already
    /// in flight are skipped.
    pub fn preload<I>(&self, requests: I) -> Result<usize, LoaderError>
    where
        I: IntoIterator<Item = LoadRequest>,
    {
        let shared = &self.shared;
        shared.ensure_alive()?;
        if shared.executor.is_shut_down() {
            return Err(ExecutorClosed.into());
        }

        let mut started = 0;
        for request in requests {
            let key = CacheKey::for_request(&request);
            if shared.pipeline.memory.contains(&key) {
                continue;
            }
            let (task, created) = shared
                .registry
                .find_or_create(&key, || LoadTask::new(key.clone(), request, true));
            if created {
                shared.submit(&task)?;
                started += 1;
            } else if task.is_cancelled() && task.promote_to_preload() {
                tracing::trace!(%key, "reviving cancelled task as preload");
                started += 1;
            }
        }
        Ok(started)
    }

    /// Detaches `consumer` from the key it is waiting for.
    ///
    /// Cancels the load if this was its last consumer, unless it is a preload.
    pub fn release(&self, consumer: ConsumerId) {
        self.shared.unbind(consumer);
    }

    /// Parks workers before they start their next task.
    pub fn pause(&self) {
        self.shared.transition(Phase::Paused);
    }

    /// Releases parked workers.
    pub fn resume(&self) {
        self.shared.transition(Phase::Running);
    }

    /// Resumes, and re-submits every task that stalled while the loader was stopped.
    pub fn recover(&self) {
        let shared = &self.shared;
        if !shared.transition(Phase::Running) {
            return;
        }

        let mut resubmitted = 0;
        for task in shared.registry.snapshot() {
            if task.restart() {
                if let Err(e) = shared.submit(&task) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key = %task.key(),
                        "failed to re-submit stalled task"
                    );
                    continue;
                }
                resubmitted += 1;
            }
        }
        tracing::debug!(resubmitted, "recovered loader");
    }

    /// Makes workers abandon their tasks at the next checkpoint, without committing or
    /// delivering results. Abandoned tasks stay registered until [`Loader::recover`].
    pub fn stop(&self) {
        self.shared.transition(Phase::Stopped);
    }

    /// Stops the loader for good and cancels every task. No notification is delivered after
    /// this returns, and further requests fail with [`LoaderError::Destroyed`].
    ///
    /// Also happens when the last handle is dropped. Workers parked by [`Loader::pause`] are
    /// released and abandon their tasks.
    pub fn destroy(&self) {
        self.shared.destroy();
    }

    /// Changes the order in which queued tasks are started, see [`TaskOrder`].
    pub fn set_task_order(&self, order: TaskOrder) {
        self.shared.executor.set_order(order);
    }

    pub fn phase(&self) -> Phase {
        self.shared.lifecycle.phase()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Number of registered tasks.
    pub fn in_flight(&self) -> usize {
        self.shared.registry.len()
    }

    /// State of the task registered for `key`.
    pub fn task_state(&self, key: &CacheKey) -> Option<TaskState> {
        self.shared.registry.get(key).map(|task| task.state())
    }

    pub fn memory_cache(&self) -> &MemoryCache<T> {
        &self.shared.pipeline.memory
    }

    pub fn disk_cache(&self) -> Option<&Arc<DiskCache>> {
        self.shared.pipeline.disk.as_ref()
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.shared.executor
    }
}

impl<T: 'static> Shared<T> {
    fn ensure_alive(&self) -> Result<(), LoaderError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(LoaderError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Whether notifications are currently withheld.
    fn suppressed(&self) -> bool {
        self.lifecycle.exit_early() || self.destroyed.load(Ordering::SeqCst)
    }

    /// Returns `false` if the loader was destroyed, in which case nothing changes.
    fn transition(&self, phase: Phase) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            tracing::debug!(?phase, "ignoring lifecycle change of destroyed loader");
            return false;
        }
        self.lifecycle.transition(phase);
        true
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifecycle.transition(Phase::Stopped);
        self.bindings.lock().clear();

        let tasks = self.registry.drain();
        let cancelled = tasks.len();
        for task in tasks {
            if let Some(done) = task.cancel() {
                self.finalize(&task, done);
            }
        }
        self.lifecycle.wake_waiters();
        tracing::debug!(cancelled, "destroyed loader");
    }

    fn unbind(&self, consumer: ConsumerId) {
        let key = self.bindings.lock().remove(&consumer);
        if let Some(key) = key {
            self.detach(consumer, &key);
        }
    }

    /// Drops the binding of `consumer`, if it still points to `key`.
    fn forget_binding(&self, consumer: ConsumerId, key: &CacheKey) {
        let mut bindings = self.bindings.lock();
        if bindings.get(&consumer) == Some(key) {
            bindings.remove(&consumer);
        }
    }

    fn detach(&self, consumer: ConsumerId, key: &CacheKey) {
        let Some(task) = self.registry.get(key) else {
            return;
        };
        if task.detach(consumer) == Detach::Orphaned {
            tracing::trace!(%key, "cancelling task without consumers");
            if let Some(done) = task.cancel() {
                self.finalize(&task, done);
            }
            self.lifecycle.wake_waiters();
        }
    }

    /// Cancels `task` regardless of what its worker is doing.
    fn cancel_now(&self, task: &Arc<LoadTask<T>>) {
        if let Some(done) = task.complete_cancelled() {
            self.finalize(task, done);
        }
    }

    /// Unregisters a task that reached a terminal state and notifies its consumers.
    fn finalize(&self, task: &Arc<LoadTask<T>>, done: Terminated<T>) {
        self.registry.remove(task);

        let key = task.key();
        match done.state {
            TaskState::Finished => metric!(counter("tasks.finished") += 1),
            _ => metric!(counter("tasks.cancelled") += 1),
        }
        tracing::trace!(%key, state = ?done.state, consumers = done.consumers.len(), "task done");

        if self.suppressed() {
            return;
        }
        for consumer in done.consumers {
            self.forget_binding(consumer, key);
            match done.state {
                TaskState::Finished => {
                    self.sink
                        .on_load_finished(key, consumer, done.payload.clone())
                }
                _ => self.sink.on_load_cancelled(key, consumer),
            }
        }
    }
}

impl<T> Shared<T>
where
    T: Send + Sync + 'static,
{
    fn submit(self: &Arc<Self>, task: &Arc<LoadTask<T>>) -> Result<(), ExecutorClosed> {
        // fires if the executor drops the job without running it
        let unrun = defer({
            let shared = Arc::clone(self);
            let task = Arc::clone(task);
            move || {
                tracing::debug!(key = %task.key(), "cancelling task dropped by executor");
                shared.cancel_now(&task);
            }
        });

        let shared = Arc::clone(self);
        let task = Arc::clone(task);
        self.executor.execute(move || {
            unrun.dismiss();
            shared.process(&task);
        })
    }

    /// The job executed on a worker for `task`.
    fn process(self: &Arc<Self>, task: &Arc<LoadTask<T>>) {
        if !task.begin() {
            // still pending means the task was cancelled before it started
            if task.state() == TaskState::Pending {
                self.abandon(task);
            }
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.pipeline.run(task)))
            .unwrap_or_else(|_| {
                tracing::error!(key = %task.key(), "load task panicked");
                TaskOutcome::Finished(Loaded::failed())
            });

        match outcome {
            TaskOutcome::Finished(loaded) => self.complete_finished(task, loaded),
            TaskOutcome::Cancelled => self.abandon(task),
            TaskOutcome::Stalled => self.stall(task),
        }
    }

    fn complete_finished(self: &Arc<Self>, task: &Arc<LoadTask<T>>, loaded: Loaded<T>) {
        if self.lifecycle.exit_early() {
            return self.stall(task);
        }
        if task.is_cancelled() {
            return self.abandon(task);
        }

        if let (Some(raw), Some(disk)) = (&loaded.fetched, &self.pipeline.disk) {
            disk.write(task.request().resource(), raw);
        }
        if let Some(value) = &loaded.payload {
            self.pipeline
                .memory
                .insert(task.key().clone(), Arc::clone(value));
        }

        if let Some(done) = task.finish(loaded.payload) {
            self.finalize(task, done);
        }
    }

    /// Completes the cancellation observed by a worker, or re-submits the task if a consumer
    /// attached to it again in the meantime.
    fn abandon(self: &Arc<Self>, task: &Arc<LoadTask<T>>) {
        match task.abandon() {
            Abandon::Terminated(done) => self.finalize(task, done),
            Abandon::Revived => {
                tracing::trace!(key = %task.key(), "re-submitting revived task");
                if let Err(e) = self.submit(task) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        key = %task.key(),
                        "failed to re-submit revived task"
                    );
                }
            }
            Abandon::Done => {}
        }
    }

    fn stall(self: &Arc<Self>, task: &Arc<LoadTask<T>>) {
        if !task.stall() {
            return self.abandon(task);
        }
        metric!(counter("tasks.stalled") += 1);
        tracing::debug!(key = %task.key(), "task stalled");

        // the loader may have been recovered before this task stalled
        if !self.lifecycle.exit_early() && task.restart() {
            if let Err(e) = self.submit(task) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    key = %task.key(),
                    "failed to re-submit stalled task"
                );
            }
        }
    }

}
