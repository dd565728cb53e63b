//! Liveness echo: `ping` → `ping {"pong": <payload>}`.

use std::sync::Arc;

use async_trait::async_trait;
use blum_core::{Message, Outgoing};
use serde_json::json;

use crate::builtin::builtin_metadata;
use crate::catalog::PluginEnv;
use crate::plugin::{Capability, Plugin, PluginContext, PluginError, PluginMetadata};

/// Catalog id.
pub const ID: &str = "ping";

/// Topic handled and replied on.
pub const TOPIC: &str = "ping";

/// Echoes the payload back under `pong`.
pub struct PingPlugin;

/// Catalog constructor.
pub fn build(_env: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
    Ok(Arc::new(PingPlugin))
}

#[async_trait]
impl Plugin for PingPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::topic(TOPIC)]
    }

    fn metadata(&self) -> PluginMetadata {
        builtin_metadata("Ping", "Liveness echo")
    }

    async fn handle(
        &self,
        _ctx: &PluginContext,
        msg: &Message,
    ) -> Result<Vec<Outgoing>, PluginError> {
        Ok(vec![Outgoing::new(TOPIC, json!({ "pong": msg.payload() }))])
    }
}
