use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::caching::{CacheKey, LoadRequest};
use crate::interface::{ConsumerId, Payload};

/// The lifecycle state of a [`LoadTask`].
///
/// ```text
/// Pending -> Loading -> Finished
///    |          |
///    |          +-----> Stalled -> Pending (recovered)
///    |          |          |
///    +----------+----------+----> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created and queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing the task.
    Loading,
    /// The task ran while the loader was stopped. It stays registered with its consumers and can
    /// be re-submitted.
    Stalled,
    Finished,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }
}

/// The result of a worker executing a task.
#[derive(Debug)]
pub struct Loaded<T> {
    /// The decoded value, `None` if fetching or decoding failed.
    pub payload: Payload<T>,
    /// Freshly fetched bytes that should be persisted to the disk cache.
    pub fetched: Option<Vec<u8>>,
}

impl<T> Loaded<T> {
    pub fn failed() -> Self {
        Self {
            payload: None,
            fetched: None,
        }
    }
}

/// What a worker reports back after executing a task.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Finished(Loaded<T>),
    Cancelled,
    /// The loader was stopped while the task was executing.
    Stalled,
}

/// The result of [`LoadTask::attach`].
#[derive(Debug)]
pub enum Attach<T> {
    Attached,
    AlreadyAttached,
    /// The task already finished, the consumer gets the result right away.
    Finished(Payload<T>),
    /// The task was cancelled and must not be joined.
    Cancelled,
}

/// The result of [`LoadTask::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    NotAttached,
    Detached,
    /// The last consumer of a non-preload task that has not completed yet detached. The task
    /// should be cancelled.
    Orphaned,
}

/// The result of [`LoadTask::abandon`].
#[derive(Debug)]
pub enum Abandon<T> {
    /// The task was cancelled, notify the consumers.
    Terminated(Terminated<T>),
    /// A consumer attached again after the cancellation. The task is pending and has to be
    /// submitted again.
    Revived,
    /// The task had already reached a terminal state.
    Done,
}

/// A task reaching a terminal state, together with the consumers to notify.
#[derive(Debug)]
pub struct Terminated<T> {
    pub state: TaskState,
    pub consumers: Vec<ConsumerId>,
    pub payload: Payload<T>,
}

struct TaskInner<T> {
    state: TaskState,
    consumers: Vec<ConsumerId>,
    result: Payload<T>,
}

/// One in-flight load for a key, shared by all consumers interested in it.
///
/// All state transitions happen under the task's lock, which makes reaching a terminal state an
/// exactly-once event: the caller that gets a [`Terminated`] back is the only one to notify.
pub struct LoadTask<T> {
    key: CacheKey,
    request: LoadRequest,
    preload: AtomicBool,
    cancelled: AtomicBool,
    inner: Mutex<TaskInner<T>>,
}

impl<T> LoadTask<T> {
    pub fn new(key: CacheKey, request: LoadRequest, preload: bool) -> Self {
        Self {
            key,
            request,
            preload: AtomicBool::new(preload),
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(TaskInner {
                state: TaskState::Pending,
                consumers: Vec::new(),
                result: None,
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn request(&self) -> &LoadRequest {
        &self.request
    }

    /// Preload tasks run to completion even without consumers.
    pub fn is_preload(&self) -> bool {
        self.preload.load(Ordering::SeqCst)
    }

    /// Turns a task that has not completed yet into a preload, reviving it if it was cancelled.
    pub fn promote_to_preload(&self) -> bool {
        let inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        self.preload.store(true, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        true
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation flag, for waiting on the pause gate.
    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    pub fn consumers(&self) -> Vec<ConsumerId> {
        self.inner.lock().consumers.clone()
    }

    pub fn has_consumers(&self) -> bool {
        !self.inner.lock().consumers.is_empty()
    }

    pub fn is_attached(&self, consumer: ConsumerId) -> bool {
        self.inner.lock().consumers.contains(&consumer)
    }

    /// Attaches `consumer` to the task.
    ///
    /// A task that was cancelled but has not completed yet is revived: the cancellation flag is
    /// cleared, and the worker still executing it carries on.
    pub fn attach(&self, consumer: ConsumerId) -> Attach<T> {
        let mut inner = self.inner.lock();
        match inner.state {
            TaskState::Finished => Attach::Finished(inner.result.clone()),
            TaskState::Cancelled => Attach::Cancelled,
            _ if inner.consumers.contains(&consumer) => Attach::AlreadyAttached,
            _ => {
                self.cancelled.store(false, Ordering::SeqCst);
                inner.consumers.push(consumer);
                Attach::Attached
            }
        }
    }

    pub fn detach(&self, consumer: ConsumerId) -> Detach {
        let mut inner = self.inner.lock();
        let Some(index) = inner.consumers.iter().position(|c| *c == consumer) else {
            return Detach::NotAttached;
        };
        inner.consumers.remove(index);

        if inner.consumers.is_empty() && !self.is_preload() && !inner.state.is_terminal() {
            Detach::Orphaned
        } else {
            Detach::Detached
        }
    }

    /// Moves a pending task to [`TaskState::Loading`].
    ///
    /// Returns `false` if the task was cancelled or is not pending.
    pub fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Pending || self.is_cancelled() {
            return false;
        }
        inner.state = TaskState::Loading;
        true
    }

    /// Parks a loading task in [`TaskState::Stalled`].
    pub fn stall(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Loading || self.is_cancelled() {
            return false;
        }
        inner.state = TaskState::Stalled;
        true
    }

    /// Moves a stalled task back to [`TaskState::Pending`], so it can be submitted again.
    pub fn restart(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Stalled || self.is_cancelled() {
            return false;
        }
        inner.state = TaskState::Pending;
        true
    }

    /// Completes the task with `payload`.
    ///
    /// A task that was cancelled in the meantime ends up cancelled instead. Returns `None` if the
    /// task already reached a terminal state.
    pub fn finish(&self, payload: Payload<T>) -> Option<Terminated<T>> {
        self.terminate(Some(payload))
    }

    /// Sets the cancellation flag.
    ///
    /// A worker executing the task observes the flag at its next checkpoint and completes the
    /// cancellation itself. Tasks that no worker will pick up again are cancelled right away,
    /// in which case the caller gets the [`Terminated`] to notify.
    pub fn cancel(&self) -> Option<Terminated<T>> {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.state() == TaskState::Stalled {
            self.terminate(None)
        } else {
            None
        }
    }

    /// Completes the task as cancelled, unless it already reached a terminal state.
    pub fn complete_cancelled(&self) -> Option<Terminated<T>> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.terminate(None)
    }

    /// Called by a worker that gave up on the task after observing the cancellation flag.
    ///
    /// Completes the cancellation, unless a consumer revived the task in the meantime.
    pub fn abandon(&self) -> Abandon<T> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Abandon::Done;
        }
        if self.is_cancelled() {
            return Abandon::Terminated(self.terminate_locked(&mut inner, None));
        }
        inner.state = TaskState::Pending;
        Abandon::Revived
    }

    fn terminate(&self, payload: Option<Payload<T>>) -> Option<Terminated<T>> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return None;
        }
        Some(self.terminate_locked(&mut inner, payload))
    }

    fn terminate_locked(
        &self,
        inner: &mut TaskInner<T>,
        payload: Option<Payload<T>>,
    ) -> Terminated<T> {
        let payload = match payload {
            Some(payload) if !self.is_cancelled() => {
                inner.state = TaskState::Finished;
                inner.result = payload.clone();
                payload
            }
            _ => {
                inner.state = TaskState::Cancelled;
                None
            }
        };

        Terminated {
            state: inner.state,
            consumers: std::mem::take(&mut inner.consumers),
            payload,
        }
    }
}

impl<T> fmt::Debug for LoadTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadTask")
            .field("key", &self.key)
            .field("preload", &self.is_preload())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
