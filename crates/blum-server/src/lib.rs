//! # blum-server
//!
//! Session manager and Axum WebSocket server for the blum service.
//!
//! - [`SessionManager`]: active-session index, sequence checks, routing to
//!   the plugin registry, bounded per-session outbound queues
//! - WebSocket gateway: upgrade, frame codec, heartbeat, slow-consumer and
//!   protocol-error closes
//! - `/health`, the launcher ready file, and graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod ready;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use error::ServerError;
pub use ready::{ReadySignal, remove_ready_file, write_ready_file};
pub use server::BlumServer;
pub use session::{
    CloseReason, Outbox, Session, SessionJournal, SessionLimits, SessionManager, SessionState,
};
pub use shutdown::ShutdownCoordinator;
