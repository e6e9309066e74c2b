use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::LoadTask;
use crate::caching::CacheKey;

/// Maps keys to their in-flight [`LoadTask`].
///
/// There is at most one task per key. Lookup and insertion happen under one lock, so concurrent
/// requests for the same key always end up sharing a task.
pub struct TaskRegistry<T> {
    tasks: Mutex<HashMap<CacheKey, Arc<LoadTask<T>>>>,
}

impl<T> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> TaskRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the task registered for `key`, or registers the one built by `create`.
    ///
    /// A registered task stays in place until it is removed, even if it was cancelled, so a
    /// key never has two tasks executing at once. The returned flag is `true` if the task was
    /// created by this call.
    pub fn find_or_create<F>(&self, key: &CacheKey, create: F) -> (Arc<LoadTask<T>>, bool)
    where
        F: FnOnce() -> LoadTask<T>,
    {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(key) {
            return (Arc::clone(task), false);
        }

        let task = Arc::new(create());
        tasks.insert(key.clone(), Arc::clone(&task));
        (task, true)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<LoadTask<T>>> {
        self.tasks.lock().get(key).cloned()
    }

    /// Removes `task`, if it is still the one registered for its key.
    pub fn remove(&self, task: &Arc<LoadTask<T>>) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(task.key()) {
            Some(registered) if Arc::ptr_eq(registered, task) => {
                tasks.remove(task.key());
                true
            }
            _ => false,
        }
    }

    /// All registered tasks, at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<LoadTask<T>>> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Removes and returns all registered tasks.
    pub fn drain(&self) -> Vec<Arc<LoadTask<T>>> {
        self.tasks.lock().drain().map(|(_, task)| task).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
