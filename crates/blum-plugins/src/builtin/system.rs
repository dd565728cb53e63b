//! Service introspection and a periodic status broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blum_core::{Message, Outgoing};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::builtin::builtin_metadata;
use crate::catalog::PluginEnv;
use crate::plugin::{
    Capability, HostContext, Plugin, PluginContext, PluginError, PluginMetadata, ScheduledTask,
};

/// Catalog id.
pub const ID: &str = "system";

/// Replies with the running service version.
pub const VERSION_TOPIC: &str = "system.version";

/// Published to subscribers every [`STATUS_INTERVAL`].
pub const STATUS_TOPIC: &str = "system.status";

/// Period of the status broadcast.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

const STATUS_TASK: &str = "status";

/// Answers `system.version` and publishes `system.status`.
pub struct SystemPlugin {
    version: String,
    started: Mutex<Option<Instant>>,
}

/// Catalog constructor.
pub fn build(env: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
    Ok(Arc::new(SystemPlugin {
        version: env.service_version.clone(),
        started: Mutex::new(None),
    }))
}

impl SystemPlugin {
    fn uptime_secs(&self) -> u64 {
        self.started
            .lock()
            .map_or(0, |started| started.elapsed().as_secs())
    }

    fn status(&self) -> Value {
        json!({ "name": "blumcore", "version": self.version, "uptime_secs": self.uptime_secs() })
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::topic(VERSION_TOPIC)]
    }

    fn metadata(&self) -> PluginMetadata {
        builtin_metadata("System", "Service version and periodic status")
    }

    async fn handle(
        &self,
        _ctx: &PluginContext,
        _msg: &Message,
    ) -> Result<Vec<Outgoing>, PluginError> {
        Ok(vec![Outgoing::new(VERSION_TOPIC, self.status())])
    }

    async fn start(&self, _host: &HostContext) -> Result<(), PluginError> {
        *self.started.lock() = Some(Instant::now());
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        *self.started.lock() = None;
        Ok(())
    }

    fn scheduled_tasks(&self) -> Vec<ScheduledTask> {
        vec![ScheduledTask::every(STATUS_TASK, STATUS_INTERVAL)]
    }

    async fn run_task(&self, task: &str, host: &HostContext) -> Result<(), PluginError> {
        if task != STATUS_TASK {
            return Err(PluginError::Failed(format!("unknown task {task}")));
        }
        let _ = host.sessions.publish(STATUS_TOPIC, &self.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NullSessions, RecordingSessions, SESSION, test_context, test_host};
    use blum_core::SessionId;

    fn plugin() -> Arc<dyn Plugin> {
        build(&PluginEnv {
            service_version: "9.9.9".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reports_env_version() {
        let plugin = plugin();
        let ctx = test_context(Arc::new(NullSessions));
        let msg = Message::new(SessionId::from(SESSION), VERSION_TOPIC, json!(null), 1);
        let replies = plugin.handle(&ctx, &msg).await.unwrap();
        assert_eq!(replies[0].payload["version"], "9.9.9");
        assert_eq!(replies[0].payload["uptime_secs"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_counts_from_start() {
        let plugin = plugin();
        plugin.start(&test_host(Arc::new(NullSessions))).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let ctx = test_context(Arc::new(NullSessions));
        let msg = Message::new(SessionId::from(SESSION), VERSION_TOPIC, json!(null), 1);
        let replies = plugin.handle(&ctx, &msg).await.unwrap();
        assert_eq!(replies[0].payload["uptime_secs"], 5);
    }

    #[tokio::test]
    async fn status_task_publishes() {
        let plugin = plugin();
        let sessions = Arc::new(RecordingSessions::default());
        let host = test_host(sessions.clone());
        assert_eq!(
            plugin.scheduled_tasks(),
            vec![ScheduledTask::every("status", STATUS_INTERVAL)]
        );

        plugin.run_task("status", &host).await.unwrap();
        let published = sessions.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, STATUS_TOPIC);
        assert_eq!(published[0].1["version"], "9.9.9");
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let host = test_host(Arc::new(NullSessions));
        assert!(plugin().run_task("nope", &host).await.is_err());
    }
}
