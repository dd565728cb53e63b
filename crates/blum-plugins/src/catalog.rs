//! The explicit table of plugin implementations discovery walks.

use std::collections::BTreeSet;
use std::sync::Arc;

use blum_settings::PluginSettings;

use crate::builtin;
use crate::plugin::{Plugin, PluginError};

/// Where a plugin implementation comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginOrigin {
    /// Ships with the service.
    Builtin,
    /// Supplied by an embedder; excluded in safe mode.
    External,
}

/// Inputs available to plugin constructors.
#[derive(Clone, Debug)]
pub struct PluginEnv {
    /// Version of the running service.
    pub service_version: String,
}

impl Default for PluginEnv {
    fn default() -> Self {
        Self {
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Constructor signature for catalog entries.
pub type BuildFn = fn(&PluginEnv) -> Result<Arc<dyn Plugin>, PluginError>;

/// One catalog entry.
#[derive(Clone)]
pub struct PluginFactory {
    /// Identifier used by allow and deny lists.
    pub id: &'static str,
    /// Provenance.
    pub origin: PluginOrigin,
    /// Constructor. May fail or panic; discovery isolates both.
    pub build: BuildFn,
}

impl PluginFactory {
    /// Built-in entry.
    pub const fn builtin(id: &'static str, build: BuildFn) -> Self {
        Self {
            id,
            origin: PluginOrigin::Builtin,
            build,
        }
    }

    /// External entry.
    pub const fn external(id: &'static str, build: BuildFn) -> Self {
        Self {
            id,
            origin: PluginOrigin::External,
            build,
        }
    }
}

impl std::fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFactory")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Plugins shipped with the service, in registration order.
pub fn builtin_catalog() -> Vec<PluginFactory> {
    vec![
        PluginFactory::builtin(builtin::ping::ID, builtin::ping::build),
        PluginFactory::builtin(builtin::system::ID, builtin::system::build),
        PluginFactory::builtin(builtin::subscriptions::ID, builtin::subscriptions::build),
        PluginFactory::builtin(builtin::broadcast::ID, builtin::broadcast::build),
        PluginFactory::builtin(builtin::kv::ID, builtin::kv::build),
    ]
}

/// Which catalog entries discovery may load.
#[derive(Clone, Debug, Default)]
pub struct PluginScope {
    enabled: Option<BTreeSet<String>>,
    disabled: BTreeSet<String>,
    safe_mode: bool,
}

impl PluginScope {
    /// Scope admitting everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope derived from settings.
    pub fn from_settings(settings: &PluginSettings) -> Self {
        Self {
            enabled: settings
                .enabled
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
            disabled: settings.disabled.iter().cloned().collect(),
            safe_mode: settings.safe_mode,
        }
    }

    /// Toggle safe mode.
    #[must_use]
    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    /// `None` when `factory` may load, otherwise why not.
    pub fn exclusion(&self, factory: &PluginFactory) -> Option<&'static str> {
        if self.safe_mode && factory.origin == PluginOrigin::External {
            return Some("safe mode");
        }
        if self.disabled.contains(factory.id) {
            return Some("disabled");
        }
        if let Some(enabled) = &self.enabled {
            if !enabled.contains(factory.id) {
                return Some("not enabled");
            }
        }
        None
    }
}
