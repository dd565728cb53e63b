//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BlumSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `BLUM_*` environment variable overrides
//!
//! Command-line overrides are applied by the binaries after loading;
//! [`crate::init_settings`] validates the final result. Rejected environment
//! values are returned as [`EnvWarning`]s so they can be logged once logging
//! is up.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::BlumSettings;

/// An environment override that was ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvWarning {
    /// Variable name.
    pub key: String,
    /// Rejected value.
    pub value: String,
    /// What would have been accepted.
    pub expected: &'static str,
}

impl std::fmt::Display for EnvWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ignoring {}={:?}: expected {}",
            self.key, self.value, self.expected
        )
    }
}

/// Unvalidated settings plus the env overrides rejected while loading them.
#[derive(Clone, Debug)]
pub struct LoadedSettings {
    /// Merged settings.
    pub settings: BlumSettings,
    /// Ignored environment values.
    pub warnings: Vec<EnvWarning>,
}

/// Emit warnings collected while loading. Call after logging is installed.
pub fn log_env_warnings(warnings: &[EnvWarning]) {
    for w in warnings {
        warn!(key = %w.key, value = %w.value, expected = w.expected, "invalid env var, ignoring");
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LoadedSettings> {
    load_settings_from_path(&crate::paths::settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error. The result is
/// not validated, since command-line flags may still fix it.
pub fn load_settings_from_path(path: &Path) -> Result<LoadedSettings> {
    let mut settings = read_settings_file(path)?;
    let warnings = apply_env_overrides(&mut settings);
    Ok(LoadedSettings { settings, warnings })
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<BlumSettings> {
    let defaults = serde_json::to_value(BlumSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BLUM_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut BlumSettings) -> Vec<EnvWarning> {
    apply_overrides_from(settings, |name| std::env::var(name).ok())
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored, leaving the file or default value, and
/// returned as warnings.
pub fn apply_overrides_from<F>(settings: &mut BlumSettings, lookup: F) -> Vec<EnvWarning>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = EnvReader {
        lookup,
        warnings: Vec::new(),
    };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("BLUM_BIND") {
        settings.server.bind = v;
    }
    if let Some(v) = env.usize("BLUM_MAX_SESSIONS", 1, 100_000) {
        settings.server.max_sessions = v;
    }
    if let Some(v) = env.usize("BLUM_OUTBOUND_QUEUE_BOUND", 1, 1_000_000) {
        settings.server.outbound_queue_bound = v;
    }
    if let Some(v) = env.u64("BLUM_HEARTBEAT_INTERVAL_MS", 10, 3_600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("BLUM_HEARTBEAT_TIMEOUT_MS", 10, 3_600_000) {
        settings.server.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.usize("BLUM_JOURNAL_RETENTION", 0, 1_000_000) {
        settings.server.journal_retention = v;
    }

    // ── Store / plugins / logging ───────────────────────────────────
    if let Some(v) = env.string("BLUM_STORE_PATH") {
        settings.store.path = PathBuf::from(v);
    }
    if let Some(v) = env.bool("BLUM_SAFE_MODE") {
        settings.plugins.safe_mode = v;
    }
    if let Some(v) = env.string("BLUM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("BLUM_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.string("BLUM_READY_FILE") {
        settings.ready_file = PathBuf::from(v);
    }

    // ── Launcher ────────────────────────────────────────────────────
    if let Some(v) = env.string("BLUM_SERVICE_BINARY") {
        settings.launcher.service_binary = Some(PathBuf::from(v));
    }
    if let Some(v) = env.u64("BLUM_MAX_RESTARTS", 0, u64::from(u32::MAX)) {
        settings.launcher.max_restarts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("BLUM_STARTUP_TIMEOUT_MS", 1, 3_600_000) {
        settings.launcher.startup_timeout_ms = v;
    }

    env.warnings
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
    warnings: Vec<EnvWarning>,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&mut self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        self.note(name, val, result.is_none(), "a boolean");
        result
    }

    fn u64(&mut self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        self.note(name, val, result.is_none(), "an integer in range");
        result
    }

    fn usize(&mut self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.string(name)?;
        let result = parse_usize_range(&val, min, max);
        self.note(name, val, result.is_none(), "an integer in range");
        result
    }

    fn note(&mut self, name: &str, value: String, rejected: bool, expected: &'static str) {
        if rejected {
            self.warnings.push(EnvWarning {
                key: name.to_owned(),
                value,
                expected,
            });
        }
    }
}
