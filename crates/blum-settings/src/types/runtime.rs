//! Store, plugin and logging settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::paths;

/// Persistent store location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Database file.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: paths::default_store_path(),
        }
    }
}

/// Plugin discovery scope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Allow-list of plugin ids. `None` admits every catalog entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Vec<String>>,
    /// Plugin ids never loaded, even when allow-listed.
    pub disabled: Vec<String>,
    /// Skip every plugin that does not ship with the service.
    pub safe_mode: bool,
}

/// Logging output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
