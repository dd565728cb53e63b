//! The capability surface every plugin implements.
//!
//! Beyond topic handling, a plugin may declare metadata, dependencies on
//! other plugins, `start`/`stop` hooks and periodic tasks. All of these
//! have defaults, so a plugin only overrides what it uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blum_core::{Message, Outgoing, SessionControl, SessionError, SessionId};
use blum_store::{RecordStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A topic tag a plugin answers to.
///
/// Exclusive tags may be claimed by exactly one plugin. Shared tags may be
/// claimed by several; dispatch picks the first registered.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability {
    /// Topic.
    pub tag: String,
    /// Whether a second claimant is a registration error.
    pub exclusive: bool,
}

impl Capability {
    /// Exclusive claim on `tag`.
    pub fn topic(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            exclusive: true,
        }
    }

    /// Shared claim on `tag`.
    pub fn shared(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            exclusive: false,
        }
    }
}

/// Everything a handler may touch while processing one message.
#[derive(Clone)]
pub struct PluginContext {
    /// Session the message arrived on.
    pub session_id: SessionId,
    /// Shared record store.
    pub store: RecordStore,
    /// Session operations.
    pub sessions: Arc<dyn SessionControl>,
}

/// Host services available outside of a single message: lifecycle hooks
/// and scheduled tasks.
#[derive(Clone)]
pub struct HostContext {
    /// Shared record store.
    pub store: RecordStore,
    /// Session operations.
    pub sessions: Arc<dyn SessionControl>,
}

/// Descriptive plugin metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    /// Display name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// One-line description.
    pub description: String,
    /// Author or vendor.
    pub author: String,
}

impl PluginMetadata {
    /// Metadata carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A periodic job the host runs on the plugin's behalf via
/// [`Plugin::run_task`]. The first run happens right after `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledTask {
    /// Name passed back to `run_task`.
    pub name: &'static str,
    /// Period between runs.
    pub every: Duration,
}

impl ScheduledTask {
    /// Task `name` running every `every`.
    pub const fn every(name: &'static str, every: Duration) -> Self {
        Self { name, every }
    }
}

/// Failures a plugin reports back to the framework.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The payload did not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A store call failed; `VersionConflict` reaches the client typed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A session call failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The plugin could not be constructed.
    #[error("initialization failed: {0}")]
    Init(String),
    /// The handler panicked.
    #[error("plugin panicked: {0}")]
    Panicked(String),
    /// The plugin failed to start or has been stopped.
    #[error("plugin {0} is not running")]
    Unavailable(String),
    /// Any other handler failure.
    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    /// Decode a message payload into `T`.
    pub fn parse_payload<T: DeserializeOwned>(msg: &Message) -> Result<T, Self> {
        serde_json::from_value(msg.payload().clone())
            .map_err(|e| Self::InvalidPayload(format!("{}: {e}", msg.topic())))
    }
}

/// A unit of application behavior registered against topic capabilities.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique identifier.
    fn id(&self) -> &str;

    /// Topics this plugin answers.
    fn capabilities(&self) -> Vec<Capability>;

    /// Handle one inbound message. Returned messages go back to the
    /// originating session in order.
    async fn handle(&self, ctx: &PluginContext, msg: &Message)
    -> Result<Vec<Outgoing>, PluginError>;

    /// Name, version, description and author.
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::named(self.id())
    }

    /// Ids of plugins that must be registered and running first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once, in registration order, before the server accepts
    /// connections. A failure keeps the plugin out of dispatch.
    async fn start(&self, _host: &HostContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once at shutdown in reverse registration order, and right
    /// after a failed `start`.
    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Periodic jobs to run while the plugin is running.
    fn scheduled_tasks(&self) -> Vec<ScheduledTask> {
        Vec::new()
    }

    /// Run one scheduled job. Failures are logged; the schedule continues.
    async fn run_task(&self, _task: &str, _host: &HostContext) -> Result<(), PluginError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Req {
        key: String,
    }

    #[test]
    fn capability_constructors() {
        assert!(Capability::topic("ping").exclusive);
        assert!(!Capability::shared("audit").exclusive);
    }

    #[test]
    fn parse_payload_ok() {
        let msg = Message::new(SessionId::from("s"), "kv.get", json!({"key": "a"}), 1);
        let req: Req = PluginError::parse_payload(&msg).unwrap();
        assert_eq!(req.key, "a");
    }

    struct Minimal;

    #[async_trait]
    impl Plugin for Minimal {
        fn id(&self) -> &str {
            "minimal"
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![]
        }
        async fn handle(
            &self,
            _ctx: &PluginContext,
            _msg: &Message,
        ) -> Result<Vec<Outgoing>, PluginError> {
            Ok(vec![])
        }
    }

    #[test]
    fn defaults_are_inert() {
        let plugin = Minimal;
        assert_eq!(plugin.metadata(), PluginMetadata::named("minimal"));
        assert!(plugin.dependencies().is_empty());
        assert!(plugin.scheduled_tasks().is_empty());
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let meta = PluginMetadata {
            name: "Ping".into(),
            version: "1.0.0".into(),
            description: "echo".into(),
            author: "blum".into(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            json,
            json!({"name": "Ping", "version": "1.0.0", "description": "echo", "author": "blum"})
        );
    }

    #[test]
    fn parse_payload_names_topic() {
        let msg = Message::new(SessionId::from("s"), "kv.get", json!(42), 1);
        let err = PluginError::parse_payload::<Req>(&msg).err().unwrap();
        assert!(err.to_string().contains("kv.get"));
    }
}
