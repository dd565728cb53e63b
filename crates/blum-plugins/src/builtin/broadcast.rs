//! Fan-out to subscribers: `publish {"topic", "payload"}`.

use std::sync::Arc;

use async_trait::async_trait;
use blum_core::{Message, Outgoing};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::builtin::{builtin_metadata, subscriptions};
use crate::catalog::PluginEnv;
use crate::plugin::{Capability, Plugin, PluginContext, PluginError, PluginMetadata};

/// Catalog id.
pub const ID: &str = "broadcast";

/// Topic handled.
pub const PUBLISH_TOPIC: &str = "publish";

/// Publishes a payload to every session subscribed to a topic.
pub struct BroadcastPlugin;

/// Catalog constructor.
pub fn build(_env: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
    Ok(Arc::new(BroadcastPlugin))
}

#[derive(Deserialize)]
struct PublishRequest {
    topic: String,
    #[serde(default)]
    payload: Value,
}

#[async_trait]
impl Plugin for BroadcastPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::topic(PUBLISH_TOPIC)]
    }

    fn metadata(&self) -> PluginMetadata {
        builtin_metadata("Broadcast", "Fan-out of payloads to subscribers")
    }

    fn dependencies(&self) -> Vec<String> {
        vec![subscriptions::ID.to_owned()]
    }

    async fn handle(
        &self,
        ctx: &PluginContext,
        msg: &Message,
    ) -> Result<Vec<Outgoing>, PluginError> {
        let req: PublishRequest = PluginError::parse_payload(msg)?;
        if req.topic.is_empty() {
            return Err(PluginError::InvalidPayload("topic must not be empty".into()));
        }
        let delivered = ctx.sessions.publish(&req.topic, &req.payload);
        Ok(vec![Outgoing::new(
            PUBLISH_TOPIC,
            json!({ "topic": req.topic, "delivered": delivered }),
        )])
    }
}
