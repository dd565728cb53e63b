//! Locating the service executable.
//!
//! The service ships next to the launcher. An installed layout with the
//! launcher in `<root>/launcher/` and the service in `<root>/bin/` is also
//! searched.

use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LaunchError;

/// Service executable name without platform suffix.
pub const SERVICE_BINARY: &str = "blum-service";

/// Platform file name of the service executable.
pub fn service_file_name() -> String {
    format!("{SERVICE_BINARY}{EXE_SUFFIX}")
}

/// Candidate locations relative to the launcher's directory, in search order.
pub fn candidates(launcher_dir: &Path) -> Vec<PathBuf> {
    let name = service_file_name();
    let mut out = vec![launcher_dir.join(&name)];
    if let Some(root) = launcher_dir.parent() {
        out.push(root.join("bin").join(&name));
    }
    out
}

/// Resolve the service executable.
///
/// An explicit path is used as-is and must exist. Otherwise the candidates
/// around `launcher_dir` are tried in order.
pub fn resolve_binary_from(
    explicit: Option<&Path>,
    launcher_dir: &Path,
) -> Result<PathBuf, LaunchError> {
    let searched = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => candidates(launcher_dir),
    };
    for path in &searched {
        debug!(path = %path.display(), "checking for service binary");
        if path.is_file() {
            return Ok(path.clone());
        }
    }
    Err(LaunchError::BinaryNotFound { searched })
}

/// Resolve the service executable relative to the running launcher.
pub fn resolve_binary(explicit: Option<&Path>) -> Result<PathBuf, LaunchError> {
    let launcher_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    resolve_binary_from(explicit, &launcher_dir)
}
