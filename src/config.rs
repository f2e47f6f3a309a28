//! Hub configuration.

use std::time::Duration;

/// Configuration shared by the stream adapter and the topic bus.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a stream waits for the next event before emitting a
    /// synthetic heartbeat. This is a keep-alive window, not a task
    /// deadline; no component imposes an overall deadline.
    pub heartbeat_interval: Duration,

    /// Maximum number of topic messages parked per target tool while no
    /// matching subscription exists. The oldest message is dropped when the
    /// queue is full.
    pub pending_topic_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pending_topic_limit: 64,
        }
    }
}

impl HubConfig {
    /// Overrides the heartbeat window.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Overrides the pending topic queue cap.
    #[must_use]
    pub fn with_pending_topic_limit(mut self, limit: usize) -> Self {
        self.pending_topic_limit = limit;
        self
    }
}
