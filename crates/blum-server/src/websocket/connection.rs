//! Per-connection liveness tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Liveness state shared by a connection's reader and its heartbeat.
///
/// The reader marks the connection alive on every inbound frame, pongs
/// included; the heartbeat consumes the flag once per interval.
pub struct ConnectionLiveness {
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
}

impl ConnectionLiveness {
    /// Fresh connection, initially alive.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            connected_at: now,
        }
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if there was activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound activity (or connection).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl Default for ConnectionLiveness {
    fn default() -> Self {
        Self::new()
    }
}
