//! Task record and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states of a task.
///
/// Terminal states absorb every later update; the registry logs and ignores
/// mutations of finished tasks instead of erroring, which tolerates races
/// between duplicate completion signals and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Task has been created but work has not started.
    #[default]
    Submitted,
    /// Task is currently being processed.
    Working,
    /// Task is waiting for additional input.
    InputRequired,
    /// Task finished successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was canceled.
    Canceled,
    /// Read-side sentinel for a task id the registry does not know.
    Unknown,
}

impl TaskState {
    /// Returns `true` if the task is still in flight.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Working | Self::InputRequired)
    }

    /// Returns `true` if no further transition is permitted from this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Returns `true` if `next` is a legal successor of `self`.
    ///
    /// The graph is `Submitted → Working → {InputRequired ⇄ Working}` with
    /// every non-terminal state allowed to jump straight to a terminal one
    /// (fast-path completion, failure, cancel-before-start). Non-terminal
    /// self-loops are legal so tools can publish repeated progress updates.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if self.is_terminal() || next == TaskState::Unknown {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        match self {
            Self::Submitted => matches!(next, Self::Submitted | Self::Working),
            Self::Working => matches!(next, Self::Working | Self::InputRequired),
            Self::InputRequired => matches!(next, Self::InputRequired | Self::Working),
            _ => false,
        }
    }

    /// Wire name of the state (kebab-case, matching serde).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }
}

/// Outcome of an `update` call against the registry.
///
/// Distinguishes "ignored because terminal" from "ignored because the
/// transition is off the graph" and, at the hub facade, from "unknown id";
/// callers that only care about tolerance can ignore the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied and an event was dispatched.
    Applied,
    /// The task was already terminal; nothing changed, no event.
    IgnoredTerminal,
    /// The requested transition is not on the state graph; nothing changed.
    IgnoredInvalid,
    /// The task id is unknown (facade-level only; the registry reports this
    /// as an error instead).
    UnknownTask,
}

impl UpdateOutcome {
    /// Returns `true` if the update mutated the task.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A unit of asynchronous work tracked by the registry.
///
/// Owned exclusively by the registry; tool adapters hold only the id.
/// Reads hand out cloned snapshots, never live handles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Opaque unique identifier, assigned at creation.
    pub id: String,
    /// The original request payload; opaque to the core.
    pub query: Value,
    /// Current lifecycle state.
    pub status: TaskState,
    /// Payload set on informative or terminal updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation; non-decreasing.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a freshly submitted task.
    pub fn new(id: impl Into<String>, query: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            query,
            status: TaskState::Submitted,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds the `unknown`-status sentinel snapshot for a missing id.
    pub fn unknown(id: impl Into<String>) -> Self {
        let mut task = Self::new(id, Value::Null);
        task.status = TaskState::Unknown;
        task
    }

    /// Returns `true` if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a state change, bumping `updated_at` without ever moving it
    /// backwards.
    pub(crate) fn apply(&mut self, status: TaskState, result: Option<Value>) {
        self.status = status;
        if let Some(result) = result {
            self.result = Some(result);
        }
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
