//! Per-task subscription tables.
//!
//! Subscribers are identified by opaque [`SubscriptionId`] handles rather
//! than callback identity; each subscriber owns one unbounded channel,
//! which also gives per-task per-subscriber FIFO delivery for free.
//!
//! The tables use an outer map lock plus one lock per task, so contention
//! on one busy task never serializes subscribe/unsubscribe traffic for
//! unrelated tasks. No lock is held across an await.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{HubError, Result};
use crate::types::TaskEvent;

/// Opaque handle identifying one subscriber of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live subscription: the handle plus the receiving end of the
/// subscriber's event channel.
#[derive(Debug)]
pub struct Subscription {
    /// The handle to pass to [`SubscriptionManager::unsubscribe`].
    pub id: SubscriptionId,
    /// Events for the task, in update order.
    pub receiver: mpsc::UnboundedReceiver<TaskEvent>,
}

type SenderTable = HashMap<SubscriptionId, mpsc::UnboundedSender<TaskEvent>>;

/// Maps task ids to their sets of interested subscribers.
///
/// Subscriptions are weak references to tasks: subscribing does not require
/// the task to exist yet, and an outliving subscription never keeps task
/// state alive.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    tasks: RwLock<HashMap<String, Arc<Mutex<SenderTable>>>>,
}

impl SubscriptionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber for a task.
    ///
    /// Every call mints a unique handle, so double registration of "the
    /// same" subscriber cannot occur; idempotence is structural.
    ///
    /// The sender is inserted while the outer map guard is held, so a
    /// concurrent prune of the task's table cannot run between the lookup
    /// and the insert and strand the new subscriber in a dropped table.
    pub fn subscribe(&self, task_id: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();
        {
            let mut tasks = self.tasks.write().map_err(|_| HubError::LockPoisoned)?;
            let table = tasks.entry(task_id.to_string()).or_default();
            table
                .lock()
                .map_err(|_| HubError::LockPoisoned)?
                .insert(id, sender);
        }
        debug!(task_id, subscription_id = %id, "subscriber added");
        Ok(Subscription { id, receiver })
    }

    /// Removes a subscriber.
    ///
    /// Returns `false` (and logs) when the task or handle is unknown; a
    /// consumer disconnecting twice is not an error.
    pub fn unsubscribe(&self, task_id: &str, id: SubscriptionId) -> bool {
        let table = {
            let Ok(tasks) = self.tasks.read() else {
                warn!(task_id, "subscription table lock poisoned");
                return false;
            };
            match tasks.get(task_id) {
                Some(table) => Arc::clone(table),
                None => {
                    warn!(task_id, "unsubscribe for task with no subscribers");
                    return false;
                }
            }
        };

        let removed = match table.lock() {
            Ok(mut senders) => senders.remove(&id).is_some(),
            Err(_) => {
                warn!(task_id, "subscriber table lock poisoned");
                return false;
            }
        };
        if !removed {
            warn!(task_id, subscription_id = %id, "unsubscribe for unknown handle");
            return false;
        }

        debug!(task_id, subscription_id = %id, "subscriber removed");
        self.prune_if_empty(task_id, &table);
        true
    }

    /// Snapshots the sender list for a task so dispatch can run without
    /// holding any subscription lock. Empty when nobody is listening.
    pub(crate) fn senders(
        &self,
        task_id: &str,
    ) -> Result<Vec<(SubscriptionId, mpsc::UnboundedSender<TaskEvent>)>> {
        let tasks = self.tasks.read().map_err(|_| HubError::LockPoisoned)?;
        let Some(table) = tasks.get(task_id) else {
            return Ok(Vec::new());
        };
        let senders = table.lock().map_err(|_| HubError::LockPoisoned)?;
        Ok(senders
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect())
    }

    /// Number of live subscribers for a task.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        let Ok(tasks) = self.tasks.read() else {
            return 0;
        };
        tasks
            .get(task_id)
            .and_then(|table| table.lock().ok().map(|senders| senders.len()))
            .unwrap_or(0)
    }

    /// Drops a task's (empty) subscriber table so finished streams leave no
    /// residue. Re-checks under the outer write lock, and only removes the
    /// map entry when it still holds the table the removal came from; the
    /// entry may have been pruned and recreated by a racing subscribe.
    fn prune_if_empty(&self, task_id: &str, table: &Arc<Mutex<SenderTable>>) {
        let Ok(mut tasks) = self.tasks.write() else {
            return;
        };
        let same = tasks
            .get(task_id)
            .is_some_and(|current| Arc::ptr_eq(current, table));
        if !same {
            return;
        }
        let empty = table.lock().map(|senders| senders.is_empty()).unwrap_or(false);
        if empty {
            tasks.remove(task_id);
        }
    }
}

/// Unsubscribes on drop.
///
/// The stream adapter holds one of these so the subscription is released on
/// every exit path: normal termination, synthetic termination, or a
/// consumer that simply stops polling and drops the stream.
pub struct SubscriptionGuard {
    manager: Arc<SubscriptionManager>,
    task_id: String,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    /// Wraps an existing subscription handle.
    pub fn new(
        manager: Arc<SubscriptionManager>,
        task_id: impl Into<String>,
        id: SubscriptionId,
    ) -> Self {
        Self {
            manager,
            task_id: task_id.into(),
            id,
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.task_id, self.id);
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("task_id", &self.task_id)
            .field("id", &self.id)
            .finish()
    }
}
