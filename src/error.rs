//! Error types for the task hub.
//!
//! Most anomalies the hub encounters are *tolerated*: a duplicate terminal
//! update, an unsubscribe for a handle that is already gone, a subscriber
//! callback that panics. Those are logged and folded into return values.
//! The variants here cover the cases that are surfaced to callers, plus the
//! taxonomy used in log records.

use thiserror::Error;

use crate::types::TaskState;

/// A specialized `Result` type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// The error type for task hub operations.
#[derive(Error, Debug)]
pub enum HubError {
    /// An operation referenced a task id the registry does not know.
    ///
    /// Writers get this error; the read side (`get`) returns an
    /// `unknown`-status snapshot instead.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// An operation required a non-terminal task but found a terminal one.
    ///
    /// Plain `update` calls on terminal tasks are absorbed silently; this
    /// variant is returned only by operations that must report the
    /// condition, such as cancellation.
    #[error("task {task_id} is already in terminal state {state:?}")]
    TerminalState {
        /// The task that was already finished.
        task_id: String,
        /// The terminal state it was found in.
        state: TaskState,
    },

    /// A subscription handle did not match any registered subscriber.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// A subscriber callback failed during event delivery.
    ///
    /// Never propagated out of the dispatcher; used for log records and
    /// isolated per callback so sibling deliveries continue.
    #[error("event delivery failed: {0}")]
    Delivery(String),

    /// A tool adapter's work unit failed.
    #[error("tool error: {0}")]
    Tool(String),

    /// A shared table lock was poisoned by a panicking holder.
    #[error("lock poisoned")]
    LockPoisoned,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for infrastructure failures.
    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Returns `true` if this error reports a tolerated race rather than a
    /// caller bug (duplicate completion vs. cancellation and the like).
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::TerminalState { .. } | Self::SubscriptionNotFound(_)
        )
    }
}
