//! A fixed pool of worker threads with a switchable queue order.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use thiserror::Error;

use crate::utils::defer::defer;

/// The order in which queued jobs are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrder {
    /// Oldest submission first.
    Fifo,
    /// Newest submission first.
    #[default]
    Lifo,
}

/// Returned when submitting to an executor that was shut down.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("task executor is shut down")]
pub struct ExecutorClosed;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    order: TaskOrder,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    busy: AtomicUsize,
}

/// Runs submitted jobs on a bounded number of worker threads.
///
/// Workers always take the job at the front of the queue. [`TaskOrder`] decides whether new jobs
/// are pushed to the back or to the front, so changing the order only affects jobs submitted
/// afterwards.
pub struct TaskExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    /// Spawns `workers` threads, at least one.
    pub fn new(workers: usize, order: TaskOrder) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                order,
                closed: false,
            }),
            available: Condvar::new(),
            busy: AtomicUsize::new(0),
        });

        let handles = (0..workers.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("resload-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
            })
            .collect::<io::Result<Vec<_>>>()?;

        tracing::debug!(workers = handles.len(), ?order, "started task executor");

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Queues `job` for execution.
    pub fn execute<F>(&self, job: F) -> Result<(), ExecutorClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            // dropping a job may run arbitrary code, never under the lock
            drop(queue);
            drop(job);
            return Err(ExecutorClosed);
        }
        match queue.order {
            TaskOrder::Fifo => queue.jobs.push_back(Box::new(job)),
            TaskOrder::Lifo => queue.jobs.push_front(Box::new(job)),
        }
        metric!(gauge("executor.queue") = queue.jobs.len() as u64);
        drop(queue);

        self.shared.available.notify_one();
        Ok(())
    }

    pub fn set_order(&self, order: TaskOrder) {
        self.shared.queue.lock().order = order;
    }

    pub fn order(&self) -> TaskOrder {
        self.shared.queue.lock().order
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Number of workers currently running a job.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Stops accepting jobs, drops all queued ones and joins the workers.
    ///
    /// Queued jobs are dropped without running, after the queue lock was released.
    ///
    /// Jobs that are already running are allowed to finish. Calling this from a worker thread
    /// does not join that worker.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.jobs)
        };
        self.shared.available.notify_all();
        if !dropped.is_empty() {
            tracing::debug!(jobs = dropped.len(), "dropped queued jobs on shutdown");
        }
        drop(dropped);

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("task executor worker panicked");
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.closed {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };

        shared.busy.fetch_add(1, Ordering::SeqCst);
        let _busy = defer(|| {
            shared.busy.fetch_sub(1, Ordering::SeqCst);
        });

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<unknown>");
            tracing::error!(panic = message, "job panicked on task executor");
        }
    }
}
