use std::sync::Arc;
use std::time::Instant;

use crate::caching::{DiskCache, MemoryCache};
use crate::interface::{Fetcher, Resizer};
use crate::lifecycle::LifecycleState;
use crate::tasks::{LoadTask, Loaded, TaskOutcome};

/// The worker side of a load: memory cache, disk cache, fetch and decode.
pub(super) struct Pipeline<T> {
    pub memory: MemoryCache<T>,
    pub disk: Option<Arc<DiskCache>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub resizer: Arc<dyn Resizer<Output = T>>,
    pub lifecycle: Arc<LifecycleState>,
}

impl<T> Pipeline<T>
where
    T: Send + Sync + 'static,
{
    /// Executes a task that was moved to `Loading`.
    pub fn run(&self, task: &LoadTask<T>) -> TaskOutcome<T> {
        if self.lifecycle.await_if_paused(task.cancel_flag()) {
            return TaskOutcome::Cancelled;
        }
        if self.lifecycle.exit_early() {
            return TaskOutcome::Stalled;
        }
        if !task.is_preload() && !task.has_consumers() {
            task.cancel();
            return TaskOutcome::Cancelled;
        }
        self.load(task)
    }

    fn load(&self, task: &LoadTask<T>) -> TaskOutcome<T> {
        let key = task.key();
        let request = task.request();

        if let Some(value) = self.memory.get(key) {
            return TaskOutcome::Finished(Loaded {
                payload: Some(value),
                fetched: None,
            });
        }

        let cached = self
            .disk
            .as_ref()
            .and_then(|disk| disk.read(request.resource()));
        let from_disk = cached.is_some();
        let raw = match cached {
            Some(raw) => raw,
            None => {
                if task.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                let fetch_start = Instant::now();
                let fetched = self.fetcher.fetch(request);
                metric!(timer("fetch.duration") = fetch_start.elapsed());
                match fetched {
                    Ok(raw) => raw,
                    Err(e) => {
                        metric!(counter("fetch.failed") += 1);
                        tracing::warn!(
                            error = &e as &dyn std::error::Error,
                            %key,
                            "failed to fetch resource"
                        );
                        return TaskOutcome::Finished(Loaded::failed());
                    }
                }
            }
        };

        if task.is_cancelled() {
            return TaskOutcome::Cancelled;
        }
        if self.lifecycle.exit_early() {
            return TaskOutcome::Stalled;
        }

        let decoded = self.resizer.decode(&raw, request.size());
        match decoded {
            Ok(value) => TaskOutcome::Finished(Loaded {
                payload: Some(Arc::new(value)),
                fetched: (!from_disk).then_some(raw),
            }),
            Err(e) => {
                metric!(counter("decode.failed") += 1);
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    %key,
                    "failed to decode resource"
                );
                TaskOutcome::Finished(Loaded::failed())
            }
        }
    }
}
