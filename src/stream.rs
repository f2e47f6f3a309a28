//! Ordered, terminating event streams over a single task.
//!
//! A stream yields the task's events in update order and ends right after
//! the terminal event. When the underlying work stays silent for a full
//! heartbeat window the stream emits a synthetic progress event, and when
//! the work has already finished without its terminal event arriving the
//! stream synthesizes one from the work's outcome, so consumers always see
//! exactly one terminal event.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;
use crate::subscription::{Subscription, SubscriptionGuard, SubscriptionManager};
use crate::types::TaskEvent;

/// A stream of [`TaskEvent`]s for one task.
///
/// Ends after yielding a final event. The subscription backing the stream
/// is released on every exit path, including a consumer that drops the
/// stream without polling it to completion.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = TaskEvent> + Send>>,
}

impl EventStream {
    pub(crate) fn new(
        subscriptions: Arc<SubscriptionManager>,
        task_id: String,
        subscription: Subscription,
        work: Option<JoinHandle<Result<Value>>>,
        heartbeat: Duration,
    ) -> Self {
        let guard = SubscriptionGuard::new(subscriptions, task_id.clone(), subscription.id);
        let mut receiver = subscription.receiver;
        let mut work = work;

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                tokio::select! {
                    maybe = receiver.recv() => {
                        match maybe {
                            Some(event) => {
                                let last = event.is_final();
                                yield event;
                                if last {
                                    break;
                                }
                            }
                            None => {
                                warn!(
                                    task_id = %task_id,
                                    "event channel closed before terminal event"
                                );
                                yield TaskEvent::failed(&task_id, "event source disconnected");
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(heartbeat) => {
                        let finished = work.as_ref().is_some_and(JoinHandle::is_finished);
                        if !finished {
                            yield TaskEvent::heartbeat(&task_id);
                            continue;
                        }

                        // The work finished but stayed quiet for a whole
                        // window. Its real terminal event may already sit in
                        // the channel; prefer that over synthesizing one.
                        let mut saw_final = false;
                        while let Ok(event) = receiver.try_recv() {
                            let last = event.is_final();
                            yield event;
                            if last {
                                saw_final = true;
                                break;
                            }
                        }
                        if saw_final {
                            break;
                        }

                        if let Some(handle) = work.take() {
                            let event = match handle.await {
                                Ok(Ok(result)) => TaskEvent::completed(&task_id, Some(result)),
                                Ok(Err(e)) => TaskEvent::failed(&task_id, e.to_string()),
                                Err(e) => {
                                    TaskEvent::failed(&task_id, format!("worker task failed: {e}"))
                                }
                            };
                            yield event;
                        }
                        break;
                    }
                }
            }
        };

        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for EventStream {
    type Item = TaskEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

pin_project! {
    /// Fuses an event stream after its first final event.
    ///
    /// [`EventStream`] already stops on its own; this combinator protects
    /// transports fed from arbitrary event sources that might keep
    /// producing after a terminal event.
    pub struct TerminatingEventStream<S> {
        #[pin]
        inner: S,
        terminated: bool,
    }
}

impl<S> TerminatingEventStream<S> {
    /// Wraps a stream so it ends after the first final event.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            terminated: false,
        }
    }
}

impl<S: Stream<Item = TaskEvent>> Stream for TerminatingEventStream<S> {
    type Item = TaskEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.terminated {
            return Poll::Ready(None);
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_final() {
                    *this.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
