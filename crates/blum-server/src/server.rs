//! `BlumServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use blum_core::ConnectionId;
use blum_plugins::PluginRegistry;
use blum_store::RecordStore;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse, PluginSummary};
use crate::session::{CloseReason, SessionLimits, SessionManager};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::handler::run_connection;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session manager.
    pub sessions: SessionManager,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Live WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// When the server started.
    pub start_time: Instant,
}

/// The blum WebSocket server.
pub struct BlumServer {
    config: Arc<ServerConfig>,
    sessions: SessionManager,
    shutdown: Arc<ShutdownCoordinator>,
    connections: Arc<AtomicUsize>,
    start_time: Instant,
}

impl BlumServer {
    /// Create a server dispatching to `registry` with state in `store`.
    pub fn new(config: ServerConfig, registry: Arc<PluginRegistry>, store: RecordStore) -> Self {
        let limits = SessionLimits {
            max_sessions: config.max_sessions,
            outbound_queue_bound: config.outbound_queue_bound,
            flush_timeout: config.flush_timeout,
            journal_retention: config.journal_retention,
        };
        Self {
            sessions: SessionManager::new(registry, store, limits),
            config: Arc::new(config),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            sessions: self.sessions.clone(),
            config: Arc::clone(&self.config),
            connections: Arc::clone(&self.connections),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/plugins", get(plugins_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until shutdown is requested.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr: SocketAddr =
            self.config
                .bind
                .parse()
                .map_err(|e: std::net::AddrParseError| ServerError::InvalidBind {
                    addr: self.config.bind.clone(),
                    reason: e.to_string(),
                })?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(err) = serve.await {
                error!(error = %err, "server terminated");
            }
        });

        info!(%local_addr, "blum server listening");
        Ok((local_addr, handle))
    }

    /// Stop admitting sessions, close every open one with `ServerShutdown`,
    /// then stop the listener and wait for `handle` up to `timeout`.
    pub async fn drain(&self, handle: JoinHandle<()>, timeout: Duration) -> bool {
        self.sessions.stop_accepting();
        self.sessions.close_all(CloseReason::ServerShutdown).await;
        self.shutdown.graceful_shutdown(vec![handle], Some(timeout)).await
    }

    /// Session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live WebSocket connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.sessions.is_accepting(),
        state.connections.load(Ordering::Relaxed),
        state.sessions.len(),
        state.sessions.registry().len(),
    ))
}

/// GET /plugins
async fn plugins_handler(State(state): State<AppState>) -> Json<Vec<PluginSummary>> {
    Json(health::plugin_summaries(state.sessions.registry()))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _ = state.connections.fetch_add(1, Ordering::Relaxed);
            run_connection(
                socket,
                ConnectionId::new(),
                state.sessions.clone(),
                Arc::clone(&state.config),
            )
            .await;
            let _ = state.connections.fetch_sub(1, Ordering::Relaxed);
        })
}
