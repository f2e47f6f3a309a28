//! Server-Sent Events rendering of task event streams.
//!
//! Two surfaces: [`sse_frames`] produces raw wire frames for transports
//! that write bytes themselves, and [`SseResponse`] plugs a task's event
//! stream straight into an axum handler.

use std::convert::Infallible;
use std::pin::Pin;

use axum::response::sse::{Event as AxumSseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::{Stream, StreamExt};

use crate::stream::TerminatingEventStream;
use crate::types::TaskEvent;

/// Renders an event stream as raw SSE frames.
///
/// Each event becomes one `data:` frame carrying the event's JSON. After
/// the final event a `event: done` sentinel frame follows, so consumers
/// that do not parse payloads still detect end of stream. The source is
/// fused after its first final event; nothing past it leaks onto the wire.
pub fn sse_frames<S>(events: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = TaskEvent> + Send + 'static,
{
    async_stream::stream! {
        let mut events = Box::pin(TerminatingEventStream::new(events));
        while let Some(event) = events.next().await {
            let last = event.is_final();
            yield event.to_sse_frame();
            if last {
                yield TaskEvent::done_frame().to_string();
            }
        }
    }
}

/// Type alias for the boxed axum event stream inside [`SseResponse`].
type FrameStream = Pin<Box<dyn Stream<Item = Result<AxumSseEvent, Infallible>> + Send>>;

/// An SSE response returnable from axum handlers.
pub struct SseResponse {
    stream: FrameStream,
}

impl SseResponse {
    /// Creates an SSE response from a task event stream.
    pub fn from_events<S>(events: S) -> Self
    where
        S: Stream<Item = TaskEvent> + Send + 'static,
    {
        let stream = async_stream::stream! {
            let mut events = Box::pin(TerminatingEventStream::new(events));
            while let Some(event) = events.next().await {
                let last = event.is_final();
                let data = serde_json::to_string(&event).unwrap_or_default();
                yield Ok(AxumSseEvent::default().data(data));
                if last {
                    yield Ok(AxumSseEvent::default().event("done").data("{}"));
                    break;
                }
            }
        };
        Self {
            stream: Box::pin(stream),
        }
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> axum::response::Response {
        Sse::new(self.stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    }
}

impl std::fmt::Debug for SseResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseResponse").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_end_with_done_sentinel() {
        let source = futures::stream::iter(vec![
            TaskEvent::working("t-1", "step"),
            TaskEvent::completed("t-1", Some(json!("done"))),
        ]);
        let frames: Vec<String> = sse_frames(source).collect().await;

        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("data: {"));
        assert!(frames[0].ends_with("\n\n"));
        assert!(frames[1].contains("\"status\":\"completed\""));
        assert_eq!(frames[2], "event: done\ndata: {}\n\n");
    }

    #[tokio::test]
    async fn test_nothing_after_final_event() {
        let source = futures::stream::iter(vec![
            TaskEvent::completed("t-1", None),
            TaskEvent::working("t-1", "stray"),
        ]);
        let frames: Vec<String> = sse_frames(source).collect().await;

        // Terminal frame plus sentinel only.
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"final\":true"));
        assert_eq!(frames[1], TaskEvent::done_frame());
    }

    #[tokio::test]
    async fn test_no_sentinel_without_terminal_event() {
        let source = futures::stream::iter(vec![TaskEvent::working("t-1", "step")]);
        let frames: Vec<String> = sse_frames(source).collect().await;

        assert_eq!(frames.len(), 1);
        assert!(!frames[0].contains("done"));
    }

    #[tokio::test]
    async fn test_frames_are_parseable_events() {
        let source = futures::stream::iter(vec![TaskEvent::completed("t-1", Some(json!(7)))]);
        let frames: Vec<String> = sse_frames(source).collect().await;

        let payload = frames[0].strip_prefix("data: ").unwrap().trim_end();
        let event: TaskEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.task_id, "t-1");
        assert_eq!(event.message, Some(json!(7)));
    }
}
