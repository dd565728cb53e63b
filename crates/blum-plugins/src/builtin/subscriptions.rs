//! Topic subscription management for the calling session.
//!
//! `session.subscribe` / `session.unsubscribe` take `{"topic": "..."}` and
//! reply on the same topic with the session's resulting subscriptions.
//! Both are idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use blum_core::{Message, Outgoing};
use serde::Deserialize;
use serde_json::json;

use crate::builtin::builtin_metadata;
use crate::catalog::PluginEnv;
use crate::plugin::{Capability, Plugin, PluginContext, PluginError, PluginMetadata};

/// Catalog id.
pub const ID: &str = "subscriptions";

/// Add a topic.
pub const SUBSCRIBE_TOPIC: &str = "session.subscribe";

/// Remove a topic.
pub const UNSUBSCRIBE_TOPIC: &str = "session.unsubscribe";

/// Mutates the caller's subscription set.
pub struct SubscriptionsPlugin;

/// Catalog constructor.
pub fn build(_env: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
    Ok(Arc::new(SubscriptionsPlugin))
}

#[derive(Deserialize)]
struct TopicRequest {
    topic: String,
}

#[async_trait]
impl Plugin for SubscriptionsPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::topic(SUBSCRIBE_TOPIC),
            Capability::topic(UNSUBSCRIBE_TOPIC),
        ]
    }

    fn metadata(&self) -> PluginMetadata {
        builtin_metadata("Subscriptions", "Per-session topic subscriptions")
    }

    async fn handle(
        &self,
        ctx: &PluginContext,
        msg: &Message,
    ) -> Result<Vec<Outgoing>, PluginError> {
        let req: TopicRequest = PluginError::parse_payload(msg)?;
        if req.topic.is_empty() {
            return Err(PluginError::InvalidPayload("topic must not be empty".into()));
        }
        let changed = if msg.topic() == SUBSCRIBE_TOPIC {
            ctx.sessions.subscribe(&ctx.session_id, &req.topic)?
        } else {
            ctx.sessions.unsubscribe(&ctx.session_id, &req.topic)?
        };
        let subscriptions = ctx.sessions.subscriptions(&ctx.session_id)?;
        Ok(vec![Outgoing::new(
            msg.topic(),
            json!({
                "topic": req.topic,
                "changed": changed,
                "subscriptions": subscriptions,
            }),
        )])
    }
}
