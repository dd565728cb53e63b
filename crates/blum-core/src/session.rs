//! The seam through which plugins reach the session layer.
//!
//! Plugins live below the server crate, so they see sessions only through
//! [`SessionControl`]. The session manager is the production implementation.

use serde_json::Value;

use crate::ids::SessionId;

/// Failures surfaced by session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session is closing, closed, or was never registered.
    #[error("session {0} is gone")]
    SessionGone(SessionId),
    /// Inbound sequence number did not advance.
    #[error("out-of-order message on {session_id}: seq {seq} is not after {last_seen}")]
    OutOfOrder {
        /// Session the message arrived on.
        session_id: SessionId,
        /// Rejected sequence number.
        seq: u64,
        /// Highest sequence number accepted so far.
        last_seen: u64,
    },
    /// Outbound queue exceeded its bound; the session is being closed.
    #[error("session {0} is a slow consumer")]
    SlowConsumer(SessionId),
    /// A new session could not be admitted.
    #[error("session refused: {0}")]
    Refused(String),
}

/// Session operations available to plugin handlers.
pub trait SessionControl: Send + Sync {
    /// Add `topic` to the session's subscriptions. Returns `false` when it
    /// was already present.
    fn subscribe(&self, session_id: &SessionId, topic: &str) -> Result<bool, SessionError>;

    /// Remove `topic`. Returns `false` when it was not present.
    fn unsubscribe(&self, session_id: &SessionId, topic: &str) -> Result<bool, SessionError>;

    /// Current subscriptions, sorted.
    fn subscriptions(&self, session_id: &SessionId) -> Result<Vec<String>, SessionError>;

    /// Enqueue `payload` on `topic` for every open session subscribed to it.
    /// Returns the number of sessions that accepted the message.
    fn publish(&self, topic: &str, payload: &Value) -> usize;
}
