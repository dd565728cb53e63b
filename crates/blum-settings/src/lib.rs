//! # blum-settings
//!
//! Configuration for the blum service and launcher, loaded in layers
//! (lowest priority first):
//! 1. **Compiled defaults**: [`BlumSettings::default()`]
//! 2. **Settings file**: `~/blumcore/configuration/core.json`, deep-merged
//! 3. **Environment**: `BLUM_*` overrides
//! 4. **Command line**: applied by each binary
//!
//! Each process installs its final settings once with [`init_settings`];
//! they are never mutated afterwards.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod paths;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    EnvWarning, LoadedSettings, apply_env_overrides, apply_overrides_from, deep_merge,
    load_settings, load_settings_from_path, log_env_warnings, read_settings_file,
};
pub use paths::{blum_home, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<BlumSettings> = OnceLock::new();

/// Install the process-wide settings after validating them.
pub fn init_settings(settings: BlumSettings) -> Result<&'static BlumSettings> {
    settings.validate()?;
    SETTINGS
        .set(settings)
        .map_err(|_| SettingsError::AlreadyInitialized)?;
    SETTINGS.get().ok_or(SettingsError::AlreadyInitialized)
}

/// The installed settings, if [`init_settings`] has run.
pub fn settings() -> Option<&'static BlumSettings> {
    SETTINGS.get()
}
