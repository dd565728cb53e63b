//! WebSocket connection handling, liveness and heartbeat.

pub mod connection;
pub mod handler;
pub mod heartbeat;
