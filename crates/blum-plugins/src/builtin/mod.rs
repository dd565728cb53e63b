//! Plugins that ship with the service.

pub mod broadcast;
pub mod kv;
pub mod ping;
pub mod subscriptions;
pub mod system;

use crate::plugin::PluginMetadata;

/// Metadata for plugins shipped in this crate.
pub(crate) fn builtin_metadata(name: &str, description: &str) -> PluginMetadata {
    PluginMetadata {
        name: name.to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        description: description.to_owned(),
        author: "blum".to_owned(),
    }
}
