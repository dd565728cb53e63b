//! Readiness file the launcher polls.
//!
//! Written once the listener is bound, removed on shutdown. The write goes
//! to a sibling temp file first and is renamed into place, so a reader never
//! sees a partial document.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Contents of the ready file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadySignal {
    /// Always `"ready"`.
    pub status: String,
    /// Service process id.
    pub pid: u32,
    /// Bound listener address.
    pub addr: String,
    /// When the file was written.
    pub timestamp: DateTime<Utc>,
}

impl ReadySignal {
    /// Signal for this process listening on `addr`.
    pub fn now(addr: SocketAddr) -> Self {
        Self {
            status: "ready".into(),
            pid: std::process::id(),
            addr: addr.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Atomically write `signal` to `path`, creating parent directories.
pub fn write_ready_file(path: &Path, signal: &ReadySignal) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec(signal).map_err(io::Error::other)?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "ready file written");
    Ok(())
}

/// Remove the ready file. A missing file is not an error.
pub fn remove_ready_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}
