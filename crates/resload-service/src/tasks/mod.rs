//! Load tasks and the registry that deduplicates them by key.

mod registry;
mod task;

pub use registry::TaskRegistry;
pub use task::{Abandon, Attach, Detach, LoadTask, Loaded, TaskOutcome, TaskState, Terminated};
