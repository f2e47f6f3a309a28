//! The hub facade and the tool adapter seam.
//!
//! `TaskHub` is the one service object applications construct and share by
//! `Arc`. It owns the registry, the subscription tables, the dispatcher and
//! the topic bus, and exposes the contract tool adapters consume: create a
//! task, report progress, finish, and let observers follow along.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::dispatch::{EventCallback, NotificationDispatcher};
use crate::error::{HubError, Result};
use crate::registry::TaskRegistry;
use crate::stream::EventStream;
use crate::subscription::{Subscription, SubscriptionId, SubscriptionManager};
use crate::topic::{TopicBus, TopicCallback};
use crate::types::{Task, TaskEvent, TaskState, UpdateOutcome};

/// The seam implemented by domain tools.
///
/// The hub never looks inside a query or a result; both are opaque JSON
/// owned by the adapter.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Stable tool name, used for topic routing and logging.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str {
        ""
    }

    /// Runs the tool against a query and produces its result.
    async fn process(&self, query: &Value) -> Result<Value>;
}

/// Ties registry, subscriptions, dispatch, topics and streams together.
#[derive(Debug)]
pub struct TaskHub {
    registry: TaskRegistry,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: NotificationDispatcher,
    topics: TopicBus,
    config: HubConfig,
}

impl TaskHub {
    /// Creates a hub with the given configuration.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new());
        Self {
            registry: TaskRegistry::new(),
            dispatcher: NotificationDispatcher::new(Arc::clone(&subscriptions)),
            topics: TopicBus::new(config.pending_topic_limit),
            subscriptions,
            config,
        }
    }

    /// Allocates a new task in `Submitted` state and returns its id.
    pub fn create_task(&self, query: Value) -> Result<String> {
        self.registry.create(query)
    }

    /// Applies a status change and fans the resulting event out to
    /// subscribers.
    ///
    /// Tolerant by contract: an unknown task id, a terminal task or an
    /// off-graph transition is logged and reported through the returned
    /// [`UpdateOutcome`], never an error. Only infrastructure failures
    /// (a poisoned lock) surface as `Err`.
    ///
    /// The event is fanned out while the task table lock is still held, so
    /// concurrent updates of one task publish their events in mutation
    /// order and nothing follows a final event on any subscriber channel.
    pub fn update_task(
        &self,
        task_id: &str,
        status: TaskState,
        result: Option<Value>,
        is_final: bool,
    ) -> Result<UpdateOutcome> {
        let updated = self
            .registry
            .update_with(task_id, status, result, is_final, |event| {
                self.dispatcher.dispatch(task_id, event.clone());
            });
        match updated {
            Ok((outcome, _)) => Ok(outcome),
            Err(HubError::TaskNotFound(_)) => {
                warn!(task_id, status = status.as_str(), "update for unknown task ignored");
                Ok(UpdateOutcome::UnknownTask)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancels a task and fans the final `Canceled` event out.
    ///
    /// Unlike [`TaskHub::update_task`] this reports why it could not act:
    /// [`HubError::TaskNotFound`] or the benign [`HubError::TerminalState`].
    pub fn cancel_task(&self, task_id: &str) -> Result<TaskEvent> {
        self.registry.cancel_with(task_id, |event| {
            self.dispatcher.dispatch(task_id, event.clone());
        })
    }

    /// Returns a snapshot of the task, or an `unknown`-status sentinel for
    /// a missing id.
    pub fn get_task(&self, task_id: &str) -> Task {
        self.registry.get(task_id)
    }

    /// Registers a channel subscriber for a task's events.
    pub fn subscribe(&self, task_id: &str) -> Result<Subscription> {
        self.subscriptions.subscribe(task_id)
    }

    /// Removes a subscriber; `false` when the handle is unknown.
    pub fn unsubscribe(&self, task_id: &str, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(task_id, id)
    }

    /// Registers a callback subscriber backed by a supervised worker.
    pub fn subscribe_callback(
        &self,
        task_id: &str,
        callback: EventCallback,
    ) -> Result<SubscriptionId> {
        self.dispatcher.subscribe_callback(task_id, callback)
    }

    /// Removes a callback subscriber and its worker.
    pub fn unsubscribe_callback(&self, task_id: &str, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe_callback(task_id, id)
    }

    /// Opens an event stream over a task.
    ///
    /// The stream yields every subsequent event in update order, emits
    /// heartbeats through quiet windows, and ends after the terminal event.
    pub fn stream(&self, task_id: &str) -> Result<EventStream> {
        let subscription = self.subscriptions.subscribe(task_id)?;
        Ok(EventStream::new(
            Arc::clone(&self.subscriptions),
            task_id.to_string(),
            subscription,
            None,
            self.config.heartbeat_interval,
        ))
    }

    /// Publishes a message on a cross-tool topic.
    pub fn publish_topic_event(
        &self,
        source_tool: &str,
        target_tool: &str,
        method: &str,
        params: Value,
    ) -> Result<String> {
        self.topics.publish(source_tool, target_tool, method, params)
    }

    /// Subscribes `subscriber_tool` to `(tool, method)` topic messages.
    pub fn subscribe_topic(
        &self,
        tool: &str,
        method: &str,
        subscriber_tool: &str,
        callback: TopicCallback,
    ) -> Result<SubscriptionId> {
        self.topics.subscribe_topic(tool, method, subscriber_tool, callback)
    }

    /// Removes a topic subscription; `false` when the handle is unknown.
    pub fn unsubscribe_topic(&self, tool: &str, id: SubscriptionId) -> bool {
        self.topics.unsubscribe_topic(tool, id)
    }

    /// Removes terminal tasks whose last update is older than `age`.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize> {
        self.registry.purge_older_than(age)
    }

    /// Number of tasks currently tracked.
    pub fn task_count(&self) -> usize {
        self.registry.task_count()
    }

    /// Runs a tool to completion through the task lifecycle.
    ///
    /// Fast path for callers that only want the answer: the task is
    /// created, marked working, and finished with the tool's result or
    /// error. Observers subscribed by id still see every event.
    pub async fn invoke(&self, tool: &dyn ToolAdapter, query: Value) -> Result<Value> {
        let task_id = self.create_task(query.clone())?;
        info!(task_id = %task_id, tool = tool.name(), "invoking tool");
        self.update_task(
            &task_id,
            TaskState::Working,
            Some(Value::String(format!("{} is processing the request", tool.name()))),
            false,
        )?;

        match tool.process(&query).await {
            Ok(result) => {
                self.update_task(&task_id, TaskState::Completed, Some(result.clone()), true)?;
                Ok(result)
            }
            Err(e) => {
                self.update_task(
                    &task_id,
                    TaskState::Failed,
                    Some(Value::String(format!("error: {e}"))),
                    true,
                )?;
                Err(e)
            }
        }
    }

    /// Runs a tool in the background and returns a stream of its task's
    /// events.
    ///
    /// The stream is subscribed before the work starts, so no event can be
    /// missed; it ends with the terminal event, synthesized from the work's
    /// outcome if the work finished without reporting one.
    pub fn invoke_stream(
        self: &Arc<Self>,
        tool: Arc<dyn ToolAdapter>,
        query: Value,
    ) -> Result<(String, EventStream)> {
        let task_id = self.create_task(query.clone())?;
        let subscription = self.subscriptions.subscribe(&task_id)?;
        info!(task_id = %task_id, tool = tool.name(), "invoking tool (streaming)");

        let hub = Arc::clone(self);
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            report(
                &hub,
                &id,
                TaskState::Working,
                Some(Value::String(format!("{} is processing the request", tool.name()))),
                false,
            );
            match tool.process(&query).await {
                Ok(result) => {
                    report(&hub, &id, TaskState::Completed, Some(result.clone()), true);
                    Ok(result)
                }
                Err(e) => {
                    report(
                        &hub,
                        &id,
                        TaskState::Failed,
                        Some(Value::String(format!("error: {e}"))),
                        true,
                    );
                    Err(e)
                }
            }
        });

        let stream = EventStream::new(
            Arc::clone(&self.subscriptions),
            task_id.clone(),
            subscription,
            Some(handle),
            self.config.heartbeat_interval,
        );
        Ok((task_id, stream))
    }
}

impl Default for TaskHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// Update helper for background workers, where an infrastructure error can
/// only be logged.
fn report(hub: &TaskHub, task_id: &str, status: TaskState, result: Option<Value>, is_final: bool) {
    if let Err(e) = hub.update_task(task_id, status, result, is_final) {
        warn!(task_id, error = %e, "background status update failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolAdapter for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn process(&self, query: &Value) -> Result<Value> {
            Ok(json!({ "echo": query }))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl ToolAdapter for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        async fn process(&self, _query: &Value) -> Result<Value> {
            Err(HubError::Tool("backend unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_lifecycle_through_facade() {
        let hub = TaskHub::default();
        let task_id = hub.create_task(json!("q")).unwrap();

        let outcome = hub
            .update_task(&task_id, TaskState::Working, None, false)
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(hub.get_task(&task_id).status, TaskState::Working);

        let outcome = hub
            .update_task(&task_id, TaskState::Completed, Some(json!("done")), true)
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(hub.get_task(&task_id).result, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_tolerated() {
        let hub = TaskHub::default();
        let outcome = hub
            .update_task("missing", TaskState::Working, None, false)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::UnknownTask);
        assert_eq!(hub.get_task("missing").status, TaskState::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_reaches_subscribers() {
        let hub = TaskHub::default();
        let task_id = hub.create_task(json!("q")).unwrap();
        let mut sub = hub.subscribe(&task_id).unwrap();

        let event = hub.cancel_task(&task_id).unwrap();
        assert_eq!(event.status, TaskState::Canceled);

        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.status, TaskState::Canceled);
        assert!(received.is_final());
    }

    #[tokio::test]
    async fn test_stream_opened_before_updates_sees_both_events() {
        let hub = TaskHub::default();
        let task_id = hub.create_task(json!("q")).unwrap();
        let stream = hub.stream(&task_id).unwrap();

        hub.update_task(&task_id, TaskState::Working, None, false)
            .unwrap();
        hub.update_task(&task_id, TaskState::Completed, Some(json!("ok")), true)
            .unwrap();

        let events: Vec<TaskEvent> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, TaskState::Working);
        assert_eq!(events[1].status, TaskState::Completed);
        assert!(events[1].is_final());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_deliver_past_final() {
        for _ in 0..200 {
            let hub = Arc::new(TaskHub::default());
            let task_id = hub.create_task(json!("q")).unwrap();
            let mut subs = Vec::new();
            for _ in 0..4 {
                subs.push(hub.subscribe(&task_id).unwrap());
            }

            let progress = {
                let hub = Arc::clone(&hub);
                let id = task_id.clone();
                tokio::task::spawn_blocking(move || {
                    hub.update_task(&id, TaskState::Working, None, false).unwrap();
                })
            };
            let finish = {
                let hub = Arc::clone(&hub);
                let id = task_id.clone();
                tokio::task::spawn_blocking(move || {
                    hub.update_task(&id, TaskState::Completed, Some(json!("done")), true)
                        .unwrap();
                })
            };
            progress.await.unwrap();
            finish.await.unwrap();

            // Whatever the interleaving, no channel may carry an event
            // after the final one.
            for mut sub in subs {
                let mut saw_final = false;
                while let Ok(event) = sub.receiver.try_recv() {
                    assert!(!saw_final, "event delivered after the final event");
                    if event.is_final() {
                        saw_final = true;
                    }
                }
                assert!(saw_final);
            }
        }
    }

    #[tokio::test]
    async fn test_invoke_fast_path() {
        let hub = TaskHub::default();
        let result = hub.invoke(&EchoTool, json!("hello")).await.unwrap();
        assert_eq!(result, json!({ "echo": "hello" }));
        assert_eq!(hub.task_count(), 1);
    }

    #[tokio::test]
    async fn test_invoke_failure_marks_task_failed() {
        let hub = TaskHub::default();
        let err = hub.invoke(&BrokenTool, json!("q")).await.unwrap_err();
        assert!(matches!(err, HubError::Tool(_)));

        // The single task ends up failed with the error recorded.
        let task_id = hub.registry.task_ids().pop().unwrap();
        let task = hub.get_task(&task_id);
        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(task.result, Some(json!("error: tool error: backend unreachable")));
    }

    #[tokio::test]
    async fn test_invoke_stream_yields_progress_then_result() {
        let hub = Arc::new(TaskHub::default());
        let (task_id, stream) = hub.invoke_stream(Arc::new(EchoTool), json!("hi")).unwrap();

        let events: Vec<TaskEvent> = stream.collect().await;
        assert!(events.len() >= 2);
        assert_eq!(events[0].status, TaskState::Working);
        let last = events.last().unwrap();
        assert_eq!(last.status, TaskState::Completed);
        assert!(last.is_final());

        assert_eq!(hub.get_task(&task_id).status, TaskState::Completed);
        // The stream released its subscription on exit.
        assert_eq!(hub.subscriptions.subscriber_count(&task_id), 0);
    }

    #[tokio::test]
    async fn test_invoke_stream_failure_ends_with_failed_event() {
        let hub = Arc::new(TaskHub::default());
        let (task_id, stream) = hub.invoke_stream(Arc::new(BrokenTool), json!("q")).unwrap();

        let events: Vec<TaskEvent> = stream.collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.status, TaskState::Failed);
        assert!(last.is_final());
        assert_eq!(hub.get_task(&task_id).status, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_topic_round_trip_through_facade() {
        let hub = TaskHub::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: TopicCallback = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        hub.subscribe_topic("music", "event.done", "core", callback)
            .unwrap();

        hub.publish_topic_event("music", "music", "event.done", json!({"track": 3}))
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.params, json!({"track": 3}));
        assert_eq!(message.source, "music");
    }
}
