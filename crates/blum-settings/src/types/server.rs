//! WebSocket server and session settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port the service listens on.
pub const DEFAULT_PORT: u16 = 1256;

/// Network, session and backpressure settings for the service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Socket address to bind.
    pub bind: String,
    /// Maximum number of concurrently open sessions. New connections beyond
    /// this are refused.
    pub max_sessions: usize,
    /// Bound on each session's outbound queue. Exceeding it closes the
    /// session as a slow consumer.
    pub outbound_queue_bound: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a session is considered dead, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// How long a closing session may spend flushing queued messages.
    pub flush_timeout_ms: u64,
    /// Upper bound on a single plugin dispatch.
    pub dispatch_timeout_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Consecutive malformed frames tolerated before the connection is
    /// closed with a protocol error.
    pub max_protocol_errors: u32,
    /// Abnormally closed sessions kept in the journal for diagnosis.
    /// Cleanly closed sessions are never kept.
    pub journal_retention: usize,
}

impl ServerSettings {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Flush deadline for closing sessions.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Plugin dispatch timeout.
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{DEFAULT_PORT}"),
            max_sessions: 256,
            outbound_queue_bound: 1024,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            flush_timeout_ms: 2_000,
            dispatch_timeout_ms: 30_000,
            max_message_size: 1024 * 1024,
            max_protocol_errors: 3,
            journal_retention: 256,
        }
    }
}
