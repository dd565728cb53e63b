//! # blum-plugins
//!
//! Plugins are units of behavior registered against topic capabilities.
//!
//! - [`Plugin`]: the capability surface (id, topics, async handler)
//! - [`PluginFactory`] catalog: the explicit list discovery walks
//! - [`PluginRegistry`]: discover once at startup, dispatch by topic
//! - [`PluginHost`]: start hooks, scheduled tasks, reverse-order stop
//! - [`builtin`]: `ping`, `system`, `subscriptions`, `broadcast`, `kv`

#![deny(unsafe_code)]

pub mod builtin;
pub mod catalog;
pub mod lifecycle;
pub mod plugin;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{BuildFn, PluginEnv, PluginFactory, PluginOrigin, PluginScope, builtin_catalog};
pub use lifecycle::{MIN_TASK_PERIOD, PluginHost, StartReport};
pub use plugin::{
    Capability, HostContext, Plugin, PluginContext, PluginError, PluginMetadata, ScheduledTask,
};
pub use registry::{
    DEFAULT_DISPATCH_TIMEOUT, DiscoveryReport, Dispatch, PluginDescriptor, PluginRegistry,
    PluginState, RegistryError,
};
