//! Supervision of the service process.
//!
//! ```text
//! STOPPED ──start──▶ STARTING ──ready──▶ RUNNING
//!                       │                  │ unexpected exit
//!                       │ timeout/exit     ▼
//!                       └──────────▶ RESTARTING ──backoff──▶ STARTING
//!                                          │ limit reached
//!                                          ▼
//!                                       FAILED
//! ```
//!
//! One supervisor owns one child. Restart attempts are strictly
//! sequential: the monitor loop waits out the backoff before the next spawn.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::LaunchError;
use crate::policy::RestartPolicy;
use crate::probe::Readiness;
use crate::process::{ChildExit, ChildHandle, LaunchSpec, Spawner};

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of the supervised service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// No child.
    Stopped,
    /// Spawned, waiting for readiness.
    Starting,
    /// Ready and serving.
    Running,
    /// Waiting out the backoff before the next start.
    Restarting,
    /// Restart limit reached. Terminal.
    Failed,
}

impl ProcessState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the supervised process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisedProcess {
    /// Current state.
    pub state: ProcessState,
    /// Child pid while one is alive.
    pub pid: Option<u32>,
    /// Restarts since the last stable run.
    pub restarts: u32,
    /// How the previous child ended.
    pub last_exit: Option<ChildExit>,
}

impl Default for SupervisedProcess {
    fn default() -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            restarts: 0,
            last_exit: None,
        }
    }
}

/// Why [`Supervisor::monitor`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Stop was requested and the child was shut down.
    Stopped,
    /// The child exited with status 0 and clean exits are not restarted.
    Exited(ChildExit),
    /// The restart limit was reached.
    Failed,
}

impl SupervisorOutcome {
    /// Process exit code for the launcher.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Stopped | Self::Exited(_) => 0,
            Self::Failed => 1,
        }
    }
}

/// Starts, watches, restarts, and stops one service process.
pub struct Supervisor {
    spec: LaunchSpec,
    policy: RestartPolicy,
    spawner: Arc<dyn Spawner>,
    readiness: Arc<dyn Readiness>,
    child: Option<Box<dyn ChildHandle>>,
    status: watch::Sender<SupervisedProcess>,
}

impl Supervisor {
    /// Supervisor for `spec` in state `Stopped`.
    pub fn new(
        spec: LaunchSpec,
        policy: RestartPolicy,
        spawner: Arc<dyn Spawner>,
        readiness: Arc<dyn Readiness>,
    ) -> Self {
        let (status, _) = watch::channel(SupervisedProcess::default());
        Self {
            spec,
            policy,
            spawner,
            readiness,
            child: None,
            status,
        }
    }

    /// Current snapshot.
    pub fn status(&self) -> SupervisedProcess {
        self.status.borrow().clone()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisedProcess> {
        self.status.subscribe()
    }

    /// Spawn the service and wait for readiness.
    ///
    /// On a readiness timeout the child is stopped before returning. The
    /// restart counter is not touched here; [`Self::monitor`] owns it.
    #[instrument(skip_all, fields(program = %self.spec.program.display()))]
    pub async fn start(&mut self) -> Result<SupervisedProcess, LaunchError> {
        self.set_state(ProcessState::Starting);
        self.readiness.reset();

        let spawned_at = Utc::now();
        let child = self.spawner.spawn(&self.spec).await?;
        let pid = child.pid();
        self.status.send_modify(|s| s.pid = pid);
        self.child = Some(child);

        match self.await_ready(pid, spawned_at).await {
            Ok(()) => {
                self.set_state(ProcessState::Running);
                info!(?pid, "service ready");
                Ok(self.status())
            }
            Err(err @ LaunchError::ExitedDuringStartup { exit }) => {
                self.child = None;
                self.status.send_modify(|s| {
                    s.pid = None;
                    s.last_exit = Some(exit);
                });
                Err(err)
            }
            Err(err) => {
                if let Some(mut child) = self.child.take() {
                    let exit = shutdown_child(child.as_mut(), self.policy.grace_period).await;
                    self.status.send_modify(|s| {
                        s.pid = None;
                        s.last_exit = exit;
                    });
                }
                Err(err)
            }
        }
    }

    async fn await_ready(
        &mut self,
        pid: Option<u32>,
        spawned_at: chrono::DateTime<Utc>,
    ) -> Result<(), LaunchError> {
        let timeout = self.policy.startup_timeout;
        let deadline = Instant::now() + timeout;
        let interval = self.policy.probe_interval.max(MIN_PROBE_INTERVAL);
        let readiness = Arc::clone(&self.readiness);
        let Some(child) = self.child.as_mut() else {
            return Err(LaunchError::StartupTimeout { timeout });
        };

        loop {
            if readiness.is_ready(pid, spawned_at).await {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(?timeout, "service did not become ready");
                return Err(LaunchError::StartupTimeout { timeout });
            }
            tokio::select! {
                exit = child.wait() => {
                    let exit = exit?;
                    warn!(%exit, "service exited before becoming ready");
                    return Err(LaunchError::ExitedDuringStartup { exit });
                }
                () = time::sleep(interval.min(deadline - now)) => {}
            }
        }
    }

    /// Keep the service running until `shutdown` fires, the child exits
    /// cleanly, or the restart limit is reached.
    ///
    /// Starts the service first if no child is running. Crashes and failed
    /// starts back off `min(initial * 2^n, max)`; once the child has stayed
    /// `Running` for the stable window the counter resets.
    pub async fn monitor(&mut self, shutdown: CancellationToken) -> SupervisorOutcome {
        loop {
            if self.child.is_none() {
                let started = tokio::select! {
                    res = self.start() => Some(res),
                    () = shutdown.cancelled() => None,
                };
                match started {
                    None => {
                        let _ = self.stop().await;
                        return SupervisorOutcome::Stopped;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "service failed to start");
                        if let Some(outcome) = self.back_off(&shutdown).await {
                            return outcome;
                        }
                        continue;
                    }
                    Some(Ok(_)) => {}
                }
            }

            let Some(mut child) = self.child.take() else {
                continue;
            };
            let stable = time::sleep(self.policy.stable_after);
            tokio::pin!(stable);
            let mut stable_reached = false;

            let exited = loop {
                tokio::select! {
                    exit = child.wait() => break Some(exit),
                    () = shutdown.cancelled() => break None,
                    () = &mut stable, if !stable_reached => {
                        stable_reached = true;
                        if self.status.borrow().restarts > 0 {
                            info!("service stable, restart counter reset");
                            self.status.send_modify(|s| s.restarts = 0);
                        }
                    }
                }
            };

            let Some(exit) = exited else {
                self.child = Some(child);
                let _ = self.stop().await;
                return SupervisorOutcome::Stopped;
            };
            let exit = exit.unwrap_or_else(|err| {
                warn!(error = %err, "lost track of service process");
                ChildExit {
                    code: None,
                    signal: None,
                }
            });
            self.status.send_modify(|s| {
                s.pid = None;
                s.last_exit = Some(exit);
            });

            if exit.success() && !self.policy.restart_on_clean_exit {
                info!("service exited cleanly");
                self.set_state(ProcessState::Stopped);
                return SupervisorOutcome::Exited(exit);
            }
            warn!(%exit, "service exited unexpectedly");
            if let Some(outcome) = self.back_off(&shutdown).await {
                return outcome;
            }
        }
    }

    /// Enter `Restarting` and wait out the backoff, or enter `Failed` when
    /// the limit is reached. `Some` ends monitoring.
    async fn back_off(&mut self, shutdown: &CancellationToken) -> Option<SupervisorOutcome> {
        let restarts = self.status.borrow().restarts;
        if restarts >= self.policy.max_restarts {
            error!(
                restarts,
                max_restarts = self.policy.max_restarts,
                "restart limit reached, giving up"
            );
            self.set_state(ProcessState::Failed);
            return Some(SupervisorOutcome::Failed);
        }

        let delay = self.policy.backoff(restarts);
        self.status.send_modify(|s| {
            s.state = ProcessState::Restarting;
            s.restarts = restarts + 1;
        });
        info!(attempt = restarts + 1, ?delay, "restarting service");

        tokio::select! {
            () = shutdown.cancelled() => {
                self.set_state(ProcessState::Stopped);
                Some(SupervisorOutcome::Stopped)
            }
            () = time::sleep(delay) => None,
        }
    }

    /// Two-phase stop: SIGTERM, wait up to the grace period, then SIGKILL.
    ///
    /// Returns how the child ended, if there was one.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        let exit = match self.child.take() {
            Some(mut child) => shutdown_child(child.as_mut(), self.policy.grace_period).await,
            None => None,
        };
        self.status.send_modify(|s| {
            s.state = ProcessState::Stopped;
            s.pid = None;
            if exit.is_some() {
                s.last_exit = exit;
            }
        });
        exit
    }

    fn set_state(&self, state: ProcessState) {
        self.status.send_modify(|s| s.state = state);
    }
}

async fn shutdown_child(child: &mut dyn ChildHandle, grace: Duration) -> Option<ChildExit> {
    let pid = child.pid();
    if let Err(err) = child.terminate() {
        warn!(?pid, error = %err, "graceful stop signal failed");
    }
    match time::timeout(grace, child.wait()).await {
        Ok(Ok(exit)) => {
            info!(?pid, %exit, "service stopped");
            Some(exit)
        }
        Ok(Err(err)) => {
            warn!(?pid, error = %err, "wait failed during stop");
            None
        }
        Err(_) => {
            warn!(?pid, ?grace, "service ignored stop signal, killing");
            if let Err(err) = child.kill().await {
                warn!(?pid, error = %err, "kill failed");
            }
            child.wait().await.ok()
        }
    }
}
