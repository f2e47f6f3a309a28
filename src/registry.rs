//! Task registry: the single source of truth for task state.
//!
//! All mutations are serialized through one coarse-grained lock; task
//! volume is moderate and correctness wins over throughput here. The lock
//! is never held across an await or any I/O, so hold times stay at
//! map-operation cost.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{HubError, Result};
use crate::types::{Task, TaskEvent, TaskState, UpdateOutcome};

/// Owns the canonical state of every task.
///
/// Tool adapters hold only task ids; reads hand out cloned snapshots.
/// Tasks are never evicted automatically; callers may purge old terminal
/// entries with [`TaskRegistry::purge_older_than`].
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh task in `Submitted` state and returns its id.
    ///
    /// Has no domain failure modes; errors only if the table lock was
    /// poisoned.
    pub fn create(&self, query: Value) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let task = Task::new(&id, query);
        let mut tasks = self.tasks.write().map_err(|_| HubError::LockPoisoned)?;
        tasks.insert(id.clone(), task);
        info!(task_id = %id, "task created");
        Ok(id)
    }

    /// Applies a status change to a task.
    ///
    /// Returns the outcome together with the event to dispatch when the
    /// update was applied. Updates of terminal tasks and off-graph
    /// transitions are logged no-ops, which tolerates duplicate completion
    /// signals racing a cancellation. An unknown id is an error; callers
    /// that want the tolerant contract go through the hub facade.
    ///
    /// A final event requires a terminal state: `is_final = true` with a
    /// non-terminal `status` is rejected as invalid, and a terminal
    /// `status` always produces a final event regardless of the flag.
    pub fn update(
        &self,
        task_id: &str,
        status: TaskState,
        result: Option<Value>,
        is_final: bool,
    ) -> Result<(UpdateOutcome, Option<TaskEvent>)> {
        self.update_with(task_id, status, result, is_final, |_| {})
    }

    /// Like [`TaskRegistry::update`], but invokes `notify` with the
    /// produced event before the task table lock is released.
    ///
    /// Publishing from inside `notify` makes the mutation and its fan-out
    /// one atomic step: two racing updates cannot emit their events out of
    /// order, so no subscriber can observe an event after the final one.
    /// `notify` must not block or await; channel sends are fine.
    pub fn update_with<F>(
        &self,
        task_id: &str,
        status: TaskState,
        result: Option<Value>,
        is_final: bool,
        notify: F,
    ) -> Result<(UpdateOutcome, Option<TaskEvent>)>
    where
        F: FnOnce(&TaskEvent),
    {
        let mut tasks = self.tasks.write().map_err(|_| HubError::LockPoisoned)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Err(HubError::TaskNotFound(task_id.to_string()));
        };

        if task.status.is_terminal() {
            warn!(
                task_id,
                current = task.status.as_str(),
                requested = status.as_str(),
                "update of terminal task ignored"
            );
            return Ok((UpdateOutcome::IgnoredTerminal, None));
        }
        if is_final && !status.is_terminal() {
            warn!(
                task_id,
                requested = status.as_str(),
                "final flag on non-terminal status ignored"
            );
            return Ok((UpdateOutcome::IgnoredInvalid, None));
        }
        if !task.status.can_transition_to(status) {
            warn!(
                task_id,
                current = task.status.as_str(),
                requested = status.as_str(),
                "invalid transition ignored"
            );
            return Ok((UpdateOutcome::IgnoredInvalid, None));
        }

        task.apply(status, result.clone());
        info!(task_id, status = status.as_str(), "task updated");
        let event = TaskEvent::new(task_id, status, result, status.is_terminal());
        notify(&event);
        Ok((UpdateOutcome::Applied, Some(event)))
    }

    /// Cancels a task, producing the final `Canceled` event to dispatch.
    ///
    /// Unlike plain `update`, cancellation reports why it could not act:
    /// [`HubError::TerminalState`] when the task already finished.
    pub fn cancel(&self, task_id: &str) -> Result<TaskEvent> {
        self.cancel_with(task_id, |_| {})
    }

    /// Like [`TaskRegistry::cancel`], but invokes `notify` with the final
    /// `Canceled` event before the task table lock is released. Same
    /// contract as [`TaskRegistry::update_with`].
    pub fn cancel_with<F>(&self, task_id: &str, notify: F) -> Result<TaskEvent>
    where
        F: FnOnce(&TaskEvent),
    {
        let mut tasks = self.tasks.write().map_err(|_| HubError::LockPoisoned)?;
        let Some(task) = tasks.get_mut(task_id) else {
            return Err(HubError::TaskNotFound(task_id.to_string()));
        };
        if task.status.is_terminal() {
            return Err(HubError::TerminalState {
                task_id: task_id.to_string(),
                state: task.status,
            });
        }
        task.apply(TaskState::Canceled, None);
        info!(task_id, "task canceled");
        let event = TaskEvent::canceled(task_id);
        notify(&event);
        Ok(event)
    }

    /// Returns a snapshot of the task, or an `unknown`-status sentinel for
    /// a missing id. Read-side tolerance for observers that race creation.
    pub fn get(&self, task_id: &str) -> Task {
        match self.tasks.read() {
            Ok(tasks) => tasks
                .get(task_id)
                .cloned()
                .unwrap_or_else(|| Task::unknown(task_id)),
            Err(_) => {
                warn!(task_id, "task table lock poisoned on read");
                Task::unknown(task_id)
            }
        }
    }

    /// Returns a snapshot of the task, `None` for a missing id.
    pub fn snapshot(&self, task_id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(|_| HubError::LockPoisoned)?;
        Ok(tasks.get(task_id).cloned())
    }

    /// Number of tasks currently tracked.
    pub fn task_count(&self) -> usize {
        self.tasks.read().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Ids of all tracked tasks.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks
            .read()
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes terminal tasks whose last update is older than `age`.
    ///
    /// Returns the number of tasks removed. In-flight tasks are never
    /// purged regardless of age.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize> {
        // An age beyond chrono's range means nothing can qualify.
        let Ok(age) = chrono::Duration::from_std(age) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - age;
        let mut tasks = self.tasks.write().map_err(|_| HubError::LockPoisoned)?;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.is_terminal() && task.updated_at < cutoff));
        let removed = before - tasks.len();
        if removed > 0 {
            info!(removed, "purged old terminal tasks");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_get() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q1")).unwrap();

        let task = registry.get(&id);
        assert_eq!(task.status, TaskState::Submitted);
        assert_eq!(task.query, json!("q1"));
        assert_eq!(registry.task_count(), 1);
    }

    #[test]
    fn test_get_unknown_returns_sentinel() {
        let registry = TaskRegistry::new();
        let task = registry.get("missing");
        assert_eq!(task.status, TaskState::Unknown);
    }

    #[test]
    fn test_update_dispatches_event() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q")).unwrap();

        let (outcome, event) = registry
            .update(&id, TaskState::Working, Some(json!("step 1")), false)
            .unwrap();
        assert!(outcome.is_applied());
        let event = event.unwrap();
        assert_eq!(event.status, TaskState::Working);
        assert!(!event.is_final());

        let (outcome, event) = registry
            .update(&id, TaskState::Completed, Some(json!("done")), true)
            .unwrap();
        assert!(outcome.is_applied());
        assert!(event.unwrap().is_final());
        assert_eq!(registry.get(&id).result, Some(json!("done")));
    }

    #[test]
    fn test_terminal_update_is_noop() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q")).unwrap();
        registry
            .update(&id, TaskState::Completed, Some(json!("done")), true)
            .unwrap();

        // A late failure signal after completion must not change anything.
        let (outcome, event) = registry
            .update(&id, TaskState::Failed, Some(json!("late")), true)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::IgnoredTerminal);
        assert!(event.is_none());
        assert_eq!(registry.get(&id).status, TaskState::Completed);
        assert_eq!(registry.get(&id).result, Some(json!("done")));
    }

    #[test]
    fn test_invalid_transition_is_noop() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q")).unwrap();

        let (outcome, event) = registry
            .update(&id, TaskState::InputRequired, None, false)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::IgnoredInvalid);
        assert!(event.is_none());
        assert_eq!(registry.get(&id).status, TaskState::Submitted);
    }

    #[test]
    fn test_final_flag_requires_terminal_status() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q")).unwrap();

        let (outcome, event) = registry
            .update(&id, TaskState::Working, None, true)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::IgnoredInvalid);
        assert!(event.is_none());
    }

    #[test]
    fn test_update_unknown_id_errors() {
        let registry = TaskRegistry::new();
        let err = registry
            .update("missing", TaskState::Working, None, false)
            .unwrap_err();
        assert!(matches!(err, HubError::TaskNotFound(_)));
    }

    #[test]
    fn test_cancel() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q")).unwrap();

        let event = registry.cancel(&id).unwrap();
        assert_eq!(event.status, TaskState::Canceled);
        assert!(event.is_final());

        let err = registry.cancel(&id).unwrap_err();
        assert!(matches!(err, HubError::TerminalState { .. }));
        assert!(err.is_benign());
    }

    #[test]
    fn test_updated_at_is_monotonic() {
        let registry = TaskRegistry::new();
        let id = registry.create(json!("q")).unwrap();
        let created = registry.get(&id).updated_at;

        registry
            .update(&id, TaskState::Working, None, false)
            .unwrap();
        assert!(registry.get(&id).updated_at >= created);
    }

    #[test]
    fn test_purge_keeps_active_and_fresh_tasks() {
        let registry = TaskRegistry::new();
        let active = registry.create(json!("a")).unwrap();
        let finished = registry.create(json!("b")).unwrap();
        registry
            .update(&finished, TaskState::Completed, None, true)
            .unwrap();

        // Nothing is old enough yet.
        assert_eq!(
            registry.purge_older_than(Duration::from_secs(3600)).unwrap(),
            0
        );

        // Zero age purges the terminal task but never the active one.
        assert_eq!(registry.purge_older_than(Duration::ZERO).unwrap(), 1);
        assert_eq!(registry.get(&finished).status, TaskState::Unknown);
        assert_eq!(registry.get(&active).status, TaskState::Submitted);
    }
}
