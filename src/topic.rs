//! Cross-tool topic bus.
//!
//! Tools subscribe to `(tool, method)` topics and publish messages at each
//! other without sharing task ids. Delivery is fire-and-forget; a publish
//! to a target with no matching subscription parks the message in a
//! bounded pending queue that is flushed when a matching subscription
//! arrives, so early publishers and late subscribers still meet.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{HubError, Result};
use crate::subscription::SubscriptionId;

/// Method name that matches every published method.
pub const METHOD_WILDCARD: &str = "*";

/// A message published on a `(tool, method)` topic.
#[derive(Debug, Clone, Serialize)]
pub struct TopicMessage {
    /// Unique message id; `queued-` prefixed when the message was parked.
    pub id: String,
    /// The publishing tool.
    pub source: String,
    /// The tool the message is addressed to.
    pub target: String,
    /// The method under which the message is published.
    pub method: String,
    /// Arbitrary payload.
    pub params: Value,
    /// Publish time.
    pub sent_at: DateTime<Utc>,
}

/// A subscriber callback for topic messages.
pub type TopicCallback = Arc<dyn Fn(TopicMessage) + Send + Sync>;

struct TopicSubscription {
    id: SubscriptionId,
    method: String,
    subscriber: String,
    callback: TopicCallback,
}

impl TopicSubscription {
    fn matches(&self, method: &str) -> bool {
        self.method == method || self.method == METHOD_WILDCARD
    }
}

/// Routes cross-tool messages by `(tool, method)` topic.
///
/// The mapping is many-to-many and a tool may subscribe to topics it
/// publishes itself; self-notification is a valid use.
pub struct TopicBus {
    subscriptions: RwLock<HashMap<String, Vec<TopicSubscription>>>,
    pending: Mutex<HashMap<String, VecDeque<TopicMessage>>>,
    pending_limit: usize,
}

impl TopicBus {
    /// Creates a bus that parks at most `pending_limit` messages per target
    /// tool while no matching subscription exists.
    #[must_use]
    pub fn new(pending_limit: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_limit,
        }
    }

    /// Registers `subscriber_tool`'s interest in `method` messages
    /// addressed to `tool`.
    ///
    /// A second subscription for the same `(tool, method)` pair is not
    /// added again; the existing subscription id is returned with a
    /// warning, matching once-only topic registration. Any messages parked
    /// for the pair are flushed to the new subscriber.
    pub fn subscribe_topic(
        &self,
        tool: &str,
        method: &str,
        subscriber_tool: &str,
        callback: TopicCallback,
    ) -> Result<SubscriptionId> {
        let id = {
            let mut subs = self
                .subscriptions
                .write()
                .map_err(|_| HubError::LockPoisoned)?;
            let entries = subs.entry(tool.to_string()).or_default();

            if let Some(existing) = entries.iter().find(|s| s.method == method) {
                warn!(
                    tool,
                    method,
                    subscription_id = %existing.id,
                    "duplicate topic subscription, returning existing id"
                );
                return Ok(existing.id);
            }

            let id = SubscriptionId::new();
            entries.push(TopicSubscription {
                id,
                method: method.to_string(),
                subscriber: subscriber_tool.to_string(),
                callback: Arc::clone(&callback),
            });
            info!(tool, method, subscriber_tool, subscription_id = %id, "topic subscription added");
            id
        };

        self.flush_pending(tool, method, id, &callback);
        Ok(id)
    }

    /// Removes a topic subscription by handle.
    ///
    /// Returns `false` (logged) when the tool has no subscriptions or the
    /// handle is unknown.
    pub fn unsubscribe_topic(&self, tool: &str, id: SubscriptionId) -> bool {
        let Ok(mut subs) = self.subscriptions.write() else {
            warn!(tool, "topic table lock poisoned");
            return false;
        };
        let Some(entries) = subs.get_mut(tool) else {
            warn!(tool, "unsubscribe for tool with no topic subscriptions");
            return false;
        };
        let before = entries.len();
        entries.retain(|s| s.id != id);
        if entries.len() == before {
            warn!(tool, subscription_id = %id, "unsubscribe for unknown topic handle");
            return false;
        }
        if entries.is_empty() {
            subs.remove(tool);
        }
        info!(tool, subscription_id = %id, "topic subscription removed");
        true
    }

    /// Publishes a message to every subscriber of `(target_tool, method)`.
    ///
    /// Does not block on subscriber execution; each delivery runs as its
    /// own spawned unit and a failing callback only produces a log entry.
    /// When no subscription matches, the message is parked and a
    /// `queued-` prefixed id is returned.
    pub fn publish(
        &self,
        source_tool: &str,
        target_tool: &str,
        method: &str,
        params: Value,
    ) -> Result<String> {
        let callbacks: Vec<(SubscriptionId, TopicCallback)> = {
            let subs = self
                .subscriptions
                .read()
                .map_err(|_| HubError::LockPoisoned)?;
            subs.get(target_tool)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|s| s.matches(method))
                        .map(|s| (s.id, Arc::clone(&s.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        if callbacks.is_empty() {
            return self.park(source_tool, target_tool, method, params);
        }

        let message = TopicMessage {
            id: uuid::Uuid::new_v4().to_string(),
            source: source_tool.to_string(),
            target: target_tool.to_string(),
            method: method.to_string(),
            params,
            sent_at: Utc::now(),
        };
        info!(
            message_id = %message.id,
            source = source_tool,
            target = target_tool,
            method,
            "topic message published"
        );
        for (id, callback) in callbacks {
            deliver(id, callback, message.clone());
        }
        Ok(message.id)
    }

    /// Number of messages currently parked for a target tool.
    pub fn pending_count(&self, target_tool: &str) -> usize {
        self.pending
            .lock()
            .ok()
            .and_then(|pending| pending.get(target_tool).map(VecDeque::len))
            .unwrap_or(0)
    }

    /// Names of tools that currently hold at least one subscription.
    pub fn subscribed_tools(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscriber tool names registered for a `(tool, method)` pair.
    pub fn subscribers_of(&self, tool: &str, method: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .map(|subs| {
                subs.get(tool)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|s| s.matches(method))
                            .map(|s| s.subscriber.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn park(
        &self,
        source_tool: &str,
        target_tool: &str,
        method: &str,
        params: Value,
    ) -> Result<String> {
        let id = format!("queued-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let message = TopicMessage {
            id: id.clone(),
            source: source_tool.to_string(),
            target: target_tool.to_string(),
            method: method.to_string(),
            params,
            sent_at: Utc::now(),
        };

        let mut pending = self.pending.lock().map_err(|_| HubError::LockPoisoned)?;
        let queue = pending.entry(target_tool.to_string()).or_default();
        if queue.len() >= self.pending_limit {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    message_id = %dropped.id,
                    target = target_tool,
                    "pending topic queue full, dropping oldest message"
                );
            }
        }
        warn!(
            message_id = %id,
            source = source_tool,
            target = target_tool,
            method,
            "no matching topic subscription, message parked"
        );
        queue.push_back(message);
        Ok(id)
    }

    fn flush_pending(
        &self,
        tool: &str,
        method: &str,
        id: SubscriptionId,
        callback: &TopicCallback,
    ) {
        let flushable: Vec<TopicMessage> = {
            let Ok(mut pending) = self.pending.lock() else {
                return;
            };
            let Some(queue) = pending.get_mut(tool) else {
                return;
            };
            let mut kept = VecDeque::new();
            let mut out = Vec::new();
            while let Some(message) = queue.pop_front() {
                if method == METHOD_WILDCARD || message.method == method {
                    out.push(message);
                } else {
                    kept.push_back(message);
                }
            }
            if kept.is_empty() {
                pending.remove(tool);
            } else {
                *queue = kept;
            }
            out
        };

        for message in flushable {
            info!(message_id = %message.id, tool, "flushing parked topic message");
            deliver(id, Arc::clone(callback), message);
        }
    }
}

impl std::fmt::Debug for TopicBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicBus")
            .field("pending_limit", &self.pending_limit)
            .finish_non_exhaustive()
    }
}

/// Runs one delivery as its own unit of work so a slow or faulty
/// subscriber never blocks the publisher or its siblings.
fn deliver(id: SubscriptionId, callback: TopicCallback, message: TopicMessage) {
    tokio::spawn(async move {
        let message_id = message.id.clone();
        let result = catch_unwind(AssertUnwindSafe(|| callback(message)));
        if result.is_err() {
            error!(
                subscription_id = %id,
                message_id = %message_id,
                "topic subscriber panicked during delivery"
            );
        }
    });
}
