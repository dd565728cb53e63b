//! Plugin lifecycle: start hooks, scheduled tasks and orderly stop.
//!
//! Plugins start in registration order, which discovery already made
//! dependency-first. A plugin whose dependency is not running is never
//! started. Scheduled tasks live on one [`JoinSet`] and are cancelled
//! through a shared [`CancellationToken`] before any plugin stops.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::plugin::{HostContext, Plugin, ScheduledTask};
use crate::registry::{PluginDescriptor, PluginRegistry, PluginState, panic_message};

/// Shortest accepted task period.
pub const MIN_TASK_PERIOD: Duration = Duration::from_millis(100);

/// Outcome of [`PluginHost::start_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Plugins now running, in start order.
    pub running: Vec<String>,
    /// Plugins that did not start, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Drives every registered plugin through start and stop.
pub struct PluginHost {
    registry: Arc<PluginRegistry>,
    host: HostContext,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    started: Vec<PluginDescriptor>,
}

impl PluginHost {
    /// Host for `registry`; nothing runs until [`start_all`](Self::start_all).
    pub fn new(registry: Arc<PluginRegistry>, host: HostContext) -> Self {
        Self {
            registry,
            host,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            started: Vec::new(),
        }
    }

    /// Start every registered plugin in registration order and spawn its
    /// scheduled tasks.
    ///
    /// A failing or panicking `start` is followed by `stop`, and the plugin
    /// is marked failed so dispatch refuses it. Plugins depending on it are
    /// marked failed without being started.
    pub async fn start_all(&mut self) -> StartReport {
        let mut report = StartReport::default();
        let registry = Arc::clone(&self.registry);

        for descriptor in registry.descriptors() {
            if descriptor.state() != PluginState::Registered {
                continue;
            }
            let id = descriptor.identifier().to_owned();

            let blocked: Vec<&str> = descriptor
                .dependencies()
                .iter()
                .filter(|dep| {
                    registry.get(dep).map(PluginDescriptor::state) != Some(PluginState::Running)
                })
                .map(String::as_str)
                .collect();
            if !blocked.is_empty() {
                let reason = format!("dependency not running: {}", blocked.join(", "));
                warn!(plugin = %id, reason = %reason, "plugin not started");
                descriptor.set_state(PluginState::Failed);
                report.failed.push((id, reason));
                continue;
            }

            let call = AssertUnwindSafe(descriptor.instance.start(&self.host)).catch_unwind();
            let failure = match call.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
            };
            if let Some(reason) = failure {
                error!(plugin = %id, reason = %reason, "plugin failed to start");
                stop_contained(&id, descriptor.instance.as_ref()).await;
                descriptor.set_state(PluginState::Failed);
                counter!("plugin_start_failures_total", "plugin" => id.clone()).increment(1);
                report.failed.push((id, reason));
                continue;
            }

            descriptor.set_state(PluginState::Running);
            for task in descriptor.instance.scheduled_tasks() {
                debug!(plugin = %id, task = task.name, every = ?task.every, "scheduling task");
                let _ = self.tasks.spawn(run_schedule(
                    id.clone(),
                    Arc::clone(&descriptor.instance),
                    task,
                    self.host.clone(),
                    self.cancel.child_token(),
                ));
            }
            self.started.push(descriptor.clone());
            report.running.push(id);
        }

        info!(
            running = report.running.len(),
            failed = report.failed.len(),
            tasks = self.tasks.len(),
            "plugins started"
        );
        report
    }

    /// Number of scheduled tasks still alive.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every scheduled task and wait for them to finish. Idempotent.
    pub async fn cancel_tasks(&mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "scheduled task ended abnormally");
            }
        }
    }

    /// Cancel scheduled tasks, then stop running plugins in reverse start
    /// order. Stop failures are logged and do not stop the others.
    pub async fn stop_all(&mut self) {
        self.cancel_tasks().await;
        while let Some(descriptor) = self.started.pop() {
            stop_contained(descriptor.identifier(), descriptor.instance.as_ref()).await;
            descriptor.set_state(PluginState::Stopped);
            debug!(plugin = descriptor.identifier(), "plugin stopped");
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("started", &self.started.len())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

async fn stop_contained(id: &str, plugin: &dyn Plugin) {
    match AssertUnwindSafe(plugin.stop()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(plugin = id, error = %err, "plugin stop failed"),
        Err(panic) => {
            error!(plugin = id, reason = %panic_message(panic.as_ref()), "plugin stop panicked");
        }
    }
}

/// Fixed-rate loop: first run immediately, then every `task.every`.
async fn run_schedule(
    plugin: String,
    instance: Arc<dyn Plugin>,
    task: ScheduledTask,
    host: HostContext,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(task.every.max(MIN_TASK_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let run = AssertUnwindSafe(instance.run_task(task.name, &host)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = run => outcome,
        };
        counter!("plugin_task_runs_total", "plugin" => plugin.clone()).increment(1);
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(plugin = %plugin, task = task.name, error = %err, "scheduled task failed");
            }
            Err(panic) => {
                error!(
                    plugin = %plugin,
                    task = task.name,
                    reason = %panic_message(panic.as_ref()),
                    "scheduled task panicked"
                );
            }
        }
    }
    debug!(plugin = %plugin, task = task.name, "scheduled task cancelled");
}
