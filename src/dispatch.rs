//! Event fan-out.
//!
//! A state change must never wait on its observers: dispatch snapshots the
//! subscriber list, pushes the event into each subscriber's channel, and
//! returns. A full/closed/panicking subscriber costs a log line, never a
//! failed update and never a missed delivery to its siblings.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{HubError, Result};
use crate::subscription::{SubscriptionId, SubscriptionManager};
use crate::types::TaskEvent;

/// A subscriber callback invoked once per event.
///
/// Callbacks run on a dedicated worker task per subscriber, so events for
/// one task reach one subscriber in update order (FIFO) while subscribers
/// never block each other or the producer.
pub type EventCallback = Arc<dyn Fn(TaskEvent) + Send + Sync>;

/// Delivers events to all subscribers of a task.
#[derive(Debug)]
pub struct NotificationDispatcher {
    subscriptions: Arc<SubscriptionManager>,
    workers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher over the given subscription tables.
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            subscriptions,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Fans an event out to every subscriber of the task.
    ///
    /// Returns immediately after enqueuing; consumers observe the event on
    /// their own schedule. Subscribers whose channel has closed are pruned
    /// and logged. Never fatal to the producer.
    pub fn dispatch(&self, task_id: &str, event: TaskEvent) {
        let senders = match self.subscriptions.senders(task_id) {
            Ok(senders) => senders,
            Err(e) => {
                error!(task_id, error = %e, "dispatch skipped");
                return;
            }
        };
        if senders.is_empty() {
            debug!(task_id, "no subscribers for event");
            return;
        }

        for (id, sender) in senders {
            if sender.send(event.clone()).is_err() {
                warn!(task_id, subscription_id = %id, "subscriber channel closed, pruning");
                self.subscriptions.unsubscribe(task_id, id);
            }
        }
    }

    /// Registers a callback subscriber for a task.
    ///
    /// Spawns one supervised worker that drains the subscriber's channel
    /// and invokes the callback per event. A panicking callback is caught
    /// and logged; the worker keeps running and later events still arrive.
    pub fn subscribe_callback(
        &self,
        task_id: &str,
        callback: EventCallback,
    ) -> Result<SubscriptionId> {
        let mut sub = self.subscriptions.subscribe(task_id)?;
        let id = sub.id;
        let worker_task_id = task_id.to_string();

        let handle = tokio::spawn(async move {
            while let Some(event) = sub.receiver.recv().await {
                let result = catch_unwind(AssertUnwindSafe(|| callback(event)));
                if result.is_err() {
                    let err = HubError::Delivery(format!(
                        "callback for task {worker_task_id} panicked"
                    ));
                    error!(
                        task_id = %worker_task_id,
                        subscription_id = %id,
                        error = %err,
                        "event delivery failed"
                    );
                }
            }
        });

        self.workers
            .lock()
            .map_err(|_| HubError::LockPoisoned)?
            .insert(id, handle);
        Ok(id)
    }

    /// Removes a callback subscriber.
    ///
    /// Dropping the subscription closes the channel; the worker drains
    /// whatever is already queued and exits on its own.
    pub fn unsubscribe_callback(&self, task_id: &str, id: SubscriptionId) -> bool {
        if let Ok(mut workers) = self.workers.lock() {
            workers.remove(&id);
        }
        self.subscriptions.unsubscribe(task_id, id)
    }

    /// Number of live callback workers (for observability and tests).
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .map(|workers| workers.len())
            .unwrap_or(0)
    }
}
