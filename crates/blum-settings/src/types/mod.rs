//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a
//! settings file may name any subset of keys and the rest keep their
//! defaults.

mod launcher;
mod runtime;
mod server;

pub use launcher::*;
pub use runtime::*;
pub use server::*;

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};
use crate::paths;

/// Root settings shared by the service and the launcher.
///
/// ```json
/// {
///   "server": { "bind": "127.0.0.1:1300" },
///   "launcher": { "maxRestarts": 3 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlumSettings {
    /// WebSocket server.
    pub server: ServerSettings,
    /// Persistent store.
    pub store: StoreSettings,
    /// Plugin discovery scope.
    pub plugins: PluginSettings,
    /// Launcher restart policy.
    pub launcher: LauncherSettings,
    /// Logging output.
    pub logging: LoggingSettings,
    /// File through which the service announces readiness.
    pub ready_file: PathBuf,
}

impl Default for BlumSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            store: StoreSettings::default(),
            plugins: PluginSettings::default(),
            launcher: LauncherSettings::default(),
            logging: LoggingSettings::default(),
            ready_file: paths::default_ready_file(),
        }
    }
}

impl BlumSettings {
    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server.bind.parse().map_err(|e| {
            SettingsError::InvalidValue(format!("server.bind {:?}: {e}", self.server.bind))
        })
    }

    /// Reject combinations that would make the service or launcher misbehave.
    pub fn validate(&self) -> Result<()> {
        let _ = self.bind_addr()?;
        let server = &self.server;
        if server.outbound_queue_bound == 0 {
            return Err(invalid("server.outboundQueueBound must be at least 1"));
        }
        if server.max_sessions == 0 {
            return Err(invalid("server.maxSessions must be at least 1"));
        }
        if server.heartbeat_interval_ms == 0 {
            return Err(invalid("server.heartbeatIntervalMs must be positive"));
        }
        if server.heartbeat_timeout_ms <= server.heartbeat_interval_ms {
            return Err(invalid(
                "server.heartbeatTimeoutMs must exceed server.heartbeatIntervalMs",
            ));
        }
        if server.max_protocol_errors == 0 {
            return Err(invalid("server.maxProtocolErrors must be at least 1"));
        }
        let launcher = &self.launcher;
        if launcher.max_backoff_ms < launcher.initial_backoff_ms {
            return Err(invalid(
                "launcher.maxBackoffMs must not be below launcher.initialBackoffMs",
            ));
        }
        if launcher.startup_timeout_ms == 0 {
            return Err(invalid("launcher.startupTimeoutMs must be positive"));
        }
        if launcher.probe_interval_ms == 0 {
            return Err(invalid("launcher.probeIntervalMs must be positive"));
        }
        if let ReadinessProbeSettings::Tcp { addr } = &launcher.probe {
            let _: SocketAddr = addr.parse().map_err(|e| {
                invalid(&format!("launcher.probe.addr {addr:?}: {e}"))
            })?;
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(invalid(&format!(
                "logging.level {:?} is not a log level",
                self.logging.level
            )));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> SettingsError {
    SettingsError::InvalidValue(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BlumSettings::default().validate().unwrap();
    }

    #[test]
    fn defaults_live_under_blum_home() {
        let s = BlumSettings::default();
        assert!(s.store.path.starts_with(paths::blum_home()));
        assert!(s.ready_file.starts_with(paths::blum_home()));
    }

    #[test]
    fn zero_queue_bound_rejected() {
        let mut s = BlumSettings::default();
        s.server.outbound_queue_bound = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let mut s = BlumSettings::default();
        s.server.heartbeat_timeout_ms = s.server.heartbeat_interval_ms;
        assert!(s.validate().is_err());
    }

    #[test]
    fn backoff_bounds_checked() {
        let mut s = BlumSettings::default();
        s.launcher.initial_backoff_ms = 5_000;
        s.launcher.max_backoff_ms = 1_000;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("maxBackoffMs"));
    }

    #[test]
    fn bad_bind_rejected() {
        let mut s = BlumSettings::default();
        s.server.bind = "localhost".into();
        assert!(s.bind_addr().is_err());
        assert!(s.validate().is_err());
    }

    #[test]
    fn bad_tcp_probe_rejected() {
        let mut s = BlumSettings::default();
        s.launcher.probe = ReadinessProbeSettings::Tcp {
            addr: "nowhere".into(),
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn bad_log_level_rejected() {
        let mut s = BlumSettings::default();
        s.logging.level = "loud".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: BlumSettings =
            serde_json::from_str(r#"{"server": {"maxSessions": 4}}"#).unwrap();
        assert_eq!(s.server.max_sessions, 4);
        assert_eq!(s.server.outbound_queue_bound, 1024);
        assert_eq!(s.launcher.max_restarts, 5);
    }
}
