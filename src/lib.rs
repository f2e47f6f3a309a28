//! # taskhub
//!
//! Asynchronous task lifecycle and cross-tool notification core for agent
//! tool adapters.
//!
//! Tool adapters (weather lookup, music generation, device control, ...)
//! create tasks, report progress, and finish; this crate owns the canonical
//! task state, fans state changes out to subscribers, routes cross-tool
//! topic messages, and renders a task's event sequence as a standards-
//! compliant SSE feed with heartbeats.
//!
//! ## Components
//!
//! - [`TaskRegistry`]: single source of truth for task state and the
//!   `submitted → working → {input-required ⇄ working} → terminal` machine.
//! - [`SubscriptionManager`]: per-task subscriber tables keyed by opaque
//!   [`SubscriptionId`] handles.
//! - [`NotificationDispatcher`]: fire-and-forget fan-out that never blocks
//!   the state mutation that produced an event.
//! - [`TopicBus`]: cross-tool `(tool, method)` topic subscriptions with a
//!   pending queue for not-yet-subscribed targets.
//! - [`EventStream`]: ordered, terminating event stream for one task, with
//!   synthetic heartbeats and defensive terminal synthesis.
//! - [`TaskHub`]: the service object tying everything together and exposing
//!   the contract tool adapters consume.
//!
//! ## Example
//!
//! ```ignore
//! let hub = Arc::new(TaskHub::new(HubConfig::default()));
//! let task_id = hub.create_task(json!("what's the weather in Berlin?"));
//! let stream = hub.stream(&task_id)?;
//! hub.update_task(&task_id, TaskState::Working, None, false);
//! hub.update_task(&task_id, TaskState::Completed, Some(json!("sunny")), true);
//! // `stream` yields two events, the second final, then ends.
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod subscription;
pub mod topic;
pub mod types;

pub use config::HubConfig;
pub use dispatch::{EventCallback, NotificationDispatcher};
pub use error::{HubError, Result};
pub use hub::{TaskHub, ToolAdapter};
pub use registry::TaskRegistry;
pub use sse::{sse_frames, SseResponse};
pub use stream::{EventStream, TerminatingEventStream};
pub use subscription::{Subscription, SubscriptionGuard, SubscriptionId, SubscriptionManager};
pub use topic::{TopicBus, TopicCallback, TopicMessage};
pub use types::{Task, TaskEvent, TaskState, UpdateOutcome};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
