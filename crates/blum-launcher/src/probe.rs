//! Readiness probes: how the launcher learns the service is up.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use blum_settings::ReadinessProbeSettings;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::trace;

/// Bound on a single TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Answers "is the child with `pid`, spawned at `spawned_at`, ready?".
#[async_trait]
pub trait Readiness: Send + Sync {
    /// Probe once.
    async fn is_ready(&self, pid: Option<u32>, spawned_at: DateTime<Utc>) -> bool;

    /// Discard stale state before a new spawn.
    fn reset(&self) {}
}

/// The built-in probes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// The service writes `path` once listening.
    ReadyFile {
        /// Ready file location.
        path: PathBuf,
    },
    /// A TCP connect to `addr` succeeds.
    Tcp {
        /// `host:port`.
        addr: String,
    },
}

impl ReadinessProbe {
    /// Probe described by settings; `ready_file` is where the service is
    /// told to write.
    pub fn from_settings(settings: &ReadinessProbeSettings, ready_file: &Path) -> Self {
        match settings {
            ReadinessProbeSettings::ReadyFile => Self::ReadyFile {
                path: ready_file.to_path_buf(),
            },
            ReadinessProbeSettings::Tcp { addr } => Self::Tcp { addr: addr.clone() },
        }
    }

    /// Arguments the service needs so this probe can observe it.
    pub fn service_args(&self) -> Vec<String> {
        match self {
            Self::ReadyFile { path } => {
                vec!["--ready-file".into(), path.display().to_string()]
            }
            Self::Tcp { .. } => Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct ReadyFile {
    status: String,
    pid: u32,
    timestamp: DateTime<Utc>,
}

/// Whether the ready file at `path` was written by `pid` at or after
/// `spawned_at`.
pub fn ready_file_matches(path: &Path, pid: Option<u32>, spawned_at: DateTime<Utc>) -> bool {
    let Ok(body) = std::fs::read(path) else {
        return false;
    };
    let Ok(file) = serde_json::from_slice::<ReadyFile>(&body) else {
        trace!(path = %path.display(), "ready file unreadable");
        return false;
    };
    file.status == "ready" && Some(file.pid) == pid && file.timestamp >= spawned_at
}

#[async_trait]
impl Readiness for ReadinessProbe {
    async fn is_ready(&self, pid: Option<u32>, spawned_at: DateTime<Utc>) -> bool {
        match self {
            Self::ReadyFile { path } => ready_file_matches(path, pid, spawned_at),
            Self::Tcp { addr } => matches!(
                tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(addr.as_str()))
                    .await,
                Ok(Ok(_))
            ),
        }
    }

    fn reset(&self) {
        if let Self::ReadyFile { path } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
