//! Default on-disk locations under the blum home directory.

use std::path::PathBuf;

/// Root of the blum directory tree (`$HOME/blumcore`, or `/tmp/blumcore`
/// when `HOME` is unset).
pub fn blum_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join("blumcore")
}

/// `configuration/core.json`.
pub fn settings_path() -> PathBuf {
    blum_home().join("configuration").join("core.json")
}

/// `data/blum.db`.
pub fn default_store_path() -> PathBuf {
    blum_home().join("data").join("blum.db")
}

/// `run/service.ready`.
pub fn default_ready_file() -> PathBuf {
    blum_home().join("run").join("service.ready")
}
