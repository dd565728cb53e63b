//! Launcher restart policy and process settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the launcher probes the service for readiness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ReadinessProbeSettings {
    /// Wait for the service to write its ready file.
    ReadyFile,
    /// Wait until a TCP connect to `addr` succeeds.
    Tcp {
        /// Address to probe.
        addr: String,
    },
}

/// Restart policy and timing for the supervised service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherSettings {
    /// Explicit service binary. When unset the launcher searches next to
    /// its own executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_binary: Option<PathBuf>,
    /// Restarts attempted before giving up.
    pub max_restarts: u32,
    /// First restart delay.
    pub initial_backoff_ms: u64,
    /// Ceiling for the restart delay.
    pub max_backoff_ms: u64,
    /// Time the service has to become ready after spawn.
    pub startup_timeout_ms: u64,
    /// Time between the graceful stop signal and a forced kill.
    pub grace_period_ms: u64,
    /// Uptime after which the restart counter resets.
    pub stable_after_ms: u64,
    /// Restart even when the service exits with status 0.
    pub restart_on_clean_exit: bool,
    /// Readiness probe.
    pub probe: ReadinessProbeSettings,
    /// Interval between readiness polls.
    pub probe_interval_ms: u64,
}

impl LauncherSettings {
    /// First restart delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Restart delay ceiling.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Startup deadline.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Stop grace period.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Stable-run window.
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    /// Readiness poll interval.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            service_binary: None,
            max_restarts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            startup_timeout_ms: 15_000,
            grace_period_ms: 10_000,
            stable_after_ms: 60_000,
            restart_on_clean_exit: false,
            probe: ReadinessProbeSettings::ReadyFile,
            probe_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_probe_is_ready_file() {
        assert_eq!(LauncherSettings::default().probe, ReadinessProbeSettings::ReadyFile);
    }

    #[test]
    fn tcp_probe_parses() {
        let probe: ReadinessProbeSettings =
            serde_json::from_str(r#"{"kind":"tcp","addr":"127.0.0.1:1256"}"#).unwrap();
        assert_eq!(
            probe,
            ReadinessProbeSettings::Tcp {
                addr: "127.0.0.1:1256".into()
            }
        );
    }

    #[test]
    fn service_binary_omitted_when_unset() {
        let json = serde_json::to_value(LauncherSettings::default()).unwrap();
        assert!(json.get("serviceBinary").is_none());
        assert_eq!(json["maxRestarts"], 5);
    }
}
