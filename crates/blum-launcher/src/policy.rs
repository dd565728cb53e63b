//! Restart policy.

use std::time::Duration;

use blum_settings::LauncherSettings;

/// When and how often the supervisor restarts the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed before the process is marked failed.
    pub max_restarts: u32,
    /// Delay before the first restart.
    pub initial_backoff: Duration,
    /// Ceiling for the delay.
    pub max_backoff: Duration,
    /// Uptime after which the restart counter resets.
    pub stable_after: Duration,
    /// Restart after an exit with status 0.
    pub restart_on_clean_exit: bool,
    /// Time the service has to become ready.
    pub startup_timeout: Duration,
    /// Interval between readiness probes.
    pub probe_interval: Duration,
    /// Time between SIGTERM and SIGKILL on stop.
    pub grace_period: Duration,
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-based):
    /// `min(initial * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl From<&LauncherSettings> for RestartPolicy {
    fn from(settings: &LauncherSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            stable_after: settings.stable_after(),
            restart_on_clean_exit: settings.restart_on_clean_exit,
            startup_timeout: settings.startup_timeout(),
            probe_interval: settings.probe_interval(),
            grace_period: settings.grace_period(),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&LauncherSettings::default())
    }
}
