//! Server configuration.

use std::time::Duration;

use blum_settings::ServerSettings;

/// Runtime configuration for [`crate::server::BlumServer`].
///
/// Built from [`ServerSettings`] by the service binary. The `Default`
/// binds an ephemeral loopback port, which is what tests want.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Socket address to bind (`host:port`).
    pub bind: String,
    /// Maximum concurrently open sessions.
    pub max_sessions: usize,
    /// Bound on each session's outbound queue.
    pub outbound_queue_bound: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Deadline for flushing a closing session's queue.
    pub flush_timeout: Duration,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Consecutive malformed frames tolerated per connection.
    pub max_protocol_errors: u32,
    /// Abnormally closed sessions kept in the journal.
    pub journal_retention: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".into(),
            max_sessions: 256,
            outbound_queue_bound: 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            flush_timeout: Duration::from_secs(2),
            max_message_size: 1024 * 1024,
            max_protocol_errors: 3,
            journal_retention: 256,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            bind: settings.bind.clone(),
            max_sessions: settings.max_sessions,
            outbound_queue_bound: settings.outbound_queue_bound,
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            flush_timeout: settings.flush_timeout(),
            max_message_size: settings.max_message_size,
            max_protocol_errors: settings.max_protocol_errors,
            journal_retention: settings.journal_retention,
        }
    }
}
