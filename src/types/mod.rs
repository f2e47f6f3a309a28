//! Core data model: tasks, task states, and status-change events.

mod event;
mod task;

pub use event::TaskEvent;
pub use task::{Task, TaskState, UpdateOutcome};
