//! Status-change events delivered to subscribers and stream consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TaskState;

/// An immutable notification of a task's status change.
///
/// Once an event for a task carries `final = true`, no further events for
/// that task are emitted and any stream over the task terminates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    /// The task the event belongs to.
    pub task_id: String,
    /// The status carried by the event.
    pub status: TaskState,
    /// Optional payload: progress text, a result, or an error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// `true` for the last event of the task's lifecycle.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl TaskEvent {
    /// Creates an event with an explicit status and payload.
    pub fn new(
        task_id: impl Into<String>,
        status: TaskState,
        message: Option<Value>,
        is_final: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            message,
            is_final,
        }
    }

    /// Creates a non-final working/progress event.
    pub fn working(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskState::Working,
            Some(Value::String(message.into())),
            false,
        )
    }

    /// Creates a final completed event.
    pub fn completed(task_id: impl Into<String>, result: Option<Value>) -> Self {
        Self::new(task_id, TaskState::Completed, result, true)
    }

    /// Creates a final failed event with a human-readable description.
    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskState::Failed,
            Some(Value::String(format!("error: {}", error.into()))),
            true,
        )
    }

    /// Creates a final canceled event.
    pub fn canceled(task_id: impl Into<String>) -> Self {
        Self::new(task_id, TaskState::Canceled, None, true)
    }

    /// Creates the synthetic keep-alive event a stream emits when the
    /// underlying work has been silent for a full heartbeat window.
    pub fn heartbeat(task_id: impl Into<String>) -> Self {
        Self::working(task_id, "processing...")
    }

    /// Returns `true` if this is the last event of the task's lifecycle.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        self.is_final
    }

    /// Serializes the event to its JSON wire form.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Renders the event as one SSE frame: a `data:` line followed by a
    /// blank line.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        format!(
            "data: {}\n\n",
            serde_json::to_string(self).unwrap_or_default()
        )
    }

    /// The sentinel frame appended after the terminal event so consumers
    /// that cannot inspect `final` still detect stream end.
    #[must_use]
    pub fn done_frame() -> &'static str {
        "event: done\ndata: {}\n\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_factory_constructors() {
        let event = TaskEvent::working("t-1", "step 1");
        assert_eq!(event.status, TaskState::Working);
        assert!(!event.is_final());

        let event = TaskEvent::completed("t-1", Some(json!({"answer": 42})));
        assert_eq!(event.status, TaskState::Completed);
        assert!(event.is_final());

        let event = TaskEvent::failed("t-1", "upstream timeout");
        assert_eq!(event.status, TaskState::Failed);
        assert!(event.is_final());
        assert_eq!(event.message, Some(json!("error: upstream timeout")));

        let event = TaskEvent::canceled("t-1");
        assert_eq!(event.status, TaskState::Canceled);
        assert!(event.is_final());
    }

    #[test]
    fn test_wire_shape() {
        let event = TaskEvent::completed("t-9", Some(json!("done")));
        let json = event.to_json().unwrap();
        assert!(json.contains("\"task_id\":\"t-9\""));
        assert!(json.contains("\"status\":\"completed\""));
        assert!(json.contains("\"final\":true"));
    }

    #[test]
    fn test_sse_frame_format() {
        let event = TaskEvent::working("t-1", "hi");
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));

        assert_eq!(TaskEvent::done_frame(), "event: done\ndata: {}\n\n");
    }

    #[test]
    fn test_message_omitted_when_absent() {
        let event = TaskEvent::canceled("t-1");
        let json = event.to_json().unwrap();
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_deserialize_final_field() {
        let event: TaskEvent = serde_json::from_str(
            r#"{"task_id":"t-1","status":"working","message":"x","final":false}"#,
        )
        .unwrap();
        assert_eq!(event.task_id, "t-1");
        assert!(!event.is_final());
    }
}
