//! `/health` and `/plugins` endpoints.

use blum_plugins::{PluginMetadata, PluginRegistry, PluginState};
use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while accepting sessions, `"draining"` during shutdown.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Number of indexed sessions.
    pub active_sessions: usize,
    /// Number of registered plugins.
    pub plugins: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    accepting: bool,
    connections: usize,
    sessions: usize,
    plugins: usize,
) -> HealthResponse {
    HealthResponse {
        status: if accepting { "ok" } else { "draining" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        plugins,
    }
}

/// One entry of the `/plugins` listing.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    /// Registered identifier.
    pub id: String,
    /// Name, version, description and author.
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    /// Ids the plugin requires.
    pub dependencies: Vec<String>,
    /// Claimed topics.
    pub topics: Vec<String>,
    /// Lifecycle state.
    pub state: PluginState,
}

/// Registered plugins in registration order.
pub fn plugin_summaries(registry: &PluginRegistry) -> Vec<PluginSummary> {
    registry
        .descriptors()
        .iter()
        .map(|d| PluginSummary {
            id: d.identifier().to_owned(),
            metadata: d.metadata().clone(),
            dependencies: d.dependencies().to_vec(),
            topics: d.capabilities().iter().map(|c| c.tag.clone()).collect(),
            state: d.state(),
        })
        .collect()
}
