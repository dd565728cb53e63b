//! Plugin registry: discovery, capability claims and dispatch.
//!
//! The registry is filled exactly once at startup and is read-only
//! afterwards, so it is shared behind an `Arc` without locking. Only each
//! descriptor's [`PluginState`] changes later, driven by the lifecycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blum_core::{Message, Outgoing};
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::{PluginEnv, PluginFactory, PluginScope};
use crate::plugin::{Capability, Plugin, PluginContext, PluginError, PluginMetadata};

/// Default upper bound on a single dispatch.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a registered plugin is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Registered; `start` has not run.
    Registered,
    /// `start` succeeded.
    Running,
    /// `start` failed, or a dependency is not running.
    Failed,
    /// `stop` ran at shutdown.
    Stopped,
}

impl PluginState {
    /// Whether dispatch may route to the plugin.
    pub fn accepts_messages(self) -> bool {
        matches!(self, Self::Registered | Self::Running)
    }
}

/// A registered plugin. Identity, metadata and capabilities are fixed at
/// creation; only the state moves.
#[derive(Clone)]
pub struct PluginDescriptor {
    identifier: String,
    metadata: PluginMetadata,
    dependencies: Vec<String>,
    capabilities: BTreeSet<Capability>,
    state: Arc<Mutex<PluginState>>,
    pub(crate) instance: Arc<dyn Plugin>,
}

impl PluginDescriptor {
    /// Snapshot the plugin's identity, metadata, dependencies and
    /// capabilities.
    pub fn new(instance: Arc<dyn Plugin>) -> Self {
        Self {
            identifier: instance.id().to_owned(),
            metadata: instance.metadata(),
            dependencies: instance.dependencies(),
            capabilities: instance.capabilities().into_iter().collect(),
            state: Arc::new(Mutex::new(PluginState::Registered)),
            instance,
        }
    }

    /// Unique identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Name, version, description and author.
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Ids this plugin requires.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Claimed capabilities.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Whether any capability carries `tag`.
    pub fn handles(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.tag == tag)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: PluginState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("identifier", &self.identifier)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Registration and discovery failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two plugins claim the same tag and at least one claim is exclusive.
    #[error("capability {tag:?} of {rejected} already claimed by {owner}")]
    DuplicateCapability {
        /// Contested tag.
        tag: String,
        /// Plugin that registered first.
        owner: String,
        /// Plugin that was turned away.
        rejected: String,
    },
    /// A plugin with this identifier is already registered.
    #[error("plugin {0} is already registered")]
    DuplicateId(String),
    /// Required plugins are absent, rejected or part of a cycle.
    #[error("plugin {id} has unsatisfied dependencies: {}", missing.join(", "))]
    UnsatisfiedDependencies {
        /// Plugin that was turned away.
        id: String,
        /// Dependencies that never registered.
        missing: Vec<String>,
    },
    /// The plugin's constructor failed or panicked.
    #[error("plugin {id} failed to initialize: {reason}")]
    PluginInit {
        /// Catalog id.
        id: String,
        /// Failure message.
        reason: String,
    },
    /// `discover` was called a second time.
    #[error("plugin discovery already ran")]
    AlreadyDiscovered,
}

/// What discovery did with each catalog entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Registered plugin ids, in order.
    pub registered: Vec<String>,
    /// Entries excluded by scope, with the reason.
    pub skipped: Vec<(String, &'static str)>,
    /// Entries that failed to build or register, including those whose
    /// dependencies never registered.
    pub failures: Vec<RegistryError>,
}

/// Result of routing one message.
#[derive(Debug)]
pub enum Dispatch {
    /// A plugin handled the message.
    Handled {
        /// Handling plugin.
        plugin: String,
        /// Replies for the originating session.
        replies: Vec<Outgoing>,
    },
    /// The handling plugin failed.
    Failed {
        /// Handling plugin.
        plugin: String,
        /// Failure.
        error: PluginError,
    },
    /// The handling plugin exceeded the dispatch timeout.
    TimedOut {
        /// Handling plugin.
        plugin: String,
    },
    /// No plugin claims the topic.
    Unhandled,
}

impl Dispatch {
    /// Whether some plugin claimed the topic.
    pub fn handled(&self) -> bool {
        !matches!(self, Self::Unhandled)
    }
}

/// Ordered set of registered plugins keyed by capability.
pub struct PluginRegistry {
    descriptors: Vec<PluginDescriptor>,
    routes: HashMap<String, usize>,
    discovered: bool,
    dispatch_timeout: Duration,
}

impl PluginRegistry {
    /// Empty registry with the default dispatch timeout.
    pub fn new() -> Self {
        Self::with_dispatch_timeout(DEFAULT_DISPATCH_TIMEOUT)
    }

    /// Empty registry with a custom dispatch timeout.
    pub fn with_dispatch_timeout(dispatch_timeout: Duration) -> Self {
        Self {
            descriptors: Vec::new(),
            routes: HashMap::new(),
            discovered: false,
            dispatch_timeout,
        }
    }

    /// Build, scope-filter and register every catalog entry. Runs once.
    ///
    /// A failing or panicking constructor and a rejected registration only
    /// exclude that one plugin; they are logged and reported. Entries are
    /// registered in catalog order except that a plugin waits until all of
    /// its dependencies are registered; whatever is still waiting when no
    /// pass makes progress is reported as unsatisfied.
    pub fn discover(
        &mut self,
        catalog: &[PluginFactory],
        scope: &PluginScope,
        env: &PluginEnv,
    ) -> Result<DiscoveryReport, RegistryError> {
        if self.discovered {
            return Err(RegistryError::AlreadyDiscovered);
        }
        self.discovered = true;

        let mut report = DiscoveryReport::default();
        let mut pending = Vec::new();
        for factory in catalog {
            if let Some(reason) = scope.exclusion(factory) {
                debug!(plugin = factory.id, reason, "plugin skipped");
                report.skipped.push((factory.id.to_owned(), reason));
                continue;
            }

            let instance = match build_isolated(factory, env) {
                Ok(instance) => instance,
                Err(err) => {
                    warn!(plugin = factory.id, error = %err, "plugin excluded");
                    report.failures.push(err);
                    continue;
                }
            };

            pending.push(PluginDescriptor::new(instance));
        }

        loop {
            let ready = pending
                .iter()
                .position(|d: &PluginDescriptor| self.missing_dependencies(d).is_empty());
            let Some(index) = ready else { break };
            let descriptor = pending.remove(index);
            let id = descriptor.identifier().to_owned();
            match self.register(descriptor) {
                Ok(()) => report.registered.push(id),
                Err(err) => {
                    warn!(plugin = %id, error = %err, "plugin registration rejected");
                    report.failures.push(err);
                }
            }
        }

        for descriptor in pending {
            let err = RegistryError::UnsatisfiedDependencies {
                missing: self.missing_dependencies(&descriptor),
                id: descriptor.identifier,
            };
            warn!(error = %err, "plugin excluded");
            report.failures.push(err);
        }

        info!(
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "plugin discovery complete"
        );
        Ok(report)
    }

    /// Add a descriptor. Rejected registrations leave the registry untouched.
    ///
    /// Every dependency must already be registered.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), RegistryError> {
        if self
            .descriptors
            .iter()
            .any(|d| d.identifier == descriptor.identifier)
        {
            return Err(RegistryError::DuplicateId(descriptor.identifier));
        }

        let missing = self.missing_dependencies(&descriptor);
        if !missing.is_empty() {
            return Err(RegistryError::UnsatisfiedDependencies {
                id: descriptor.identifier,
                missing,
            });
        }

        for claim in &descriptor.capabilities {
            for existing in &self.descriptors {
                let clash = existing
                    .capabilities
                    .iter()
                    .any(|c| c.tag == claim.tag && (c.exclusive || claim.exclusive));
                if clash {
                    return Err(RegistryError::DuplicateCapability {
                        tag: claim.tag.clone(),
                        owner: existing.identifier.clone(),
                        rejected: descriptor.identifier.clone(),
                    });
                }
            }
        }

        let index = self.descriptors.len();
        for claim in &descriptor.capabilities {
            let _ = self.routes.entry(claim.tag.clone()).or_insert(index);
        }
        debug!(
            plugin = %descriptor.identifier,
            capabilities = descriptor.capabilities.len(),
            "plugin registered"
        );
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Route `msg` to the first plugin claiming its topic.
    ///
    /// Handler failures, panics and timeouts are contained and reported.
    pub async fn dispatch(&self, ctx: &PluginContext, msg: &Message) -> Dispatch {
        let Some(descriptor) = self.lookup(msg.topic()) else {
            counter!("plugin_unhandled_total").increment(1);
            return Dispatch::Unhandled;
        };
        let plugin = descriptor.identifier.clone();
        if !descriptor.state().accepts_messages() {
            counter!("plugin_unavailable_total", "plugin" => plugin.clone()).increment(1);
            return Dispatch::Failed {
                error: PluginError::Unavailable(plugin.clone()),
                plugin,
            };
        }
        counter!("plugin_dispatch_total", "plugin" => plugin.clone()).increment(1);

        let start = Instant::now();
        let call = AssertUnwindSafe(descriptor.instance.handle(ctx, msg)).catch_unwind();
        let outcome = match tokio::time::timeout(self.dispatch_timeout, call).await {
            Ok(Ok(Ok(replies))) => Dispatch::Handled { plugin, replies },
            Ok(Ok(Err(error))) => {
                debug!(plugin = %plugin, topic = msg.topic(), error = %error, "plugin failed");
                Dispatch::Failed { plugin, error }
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!(plugin = %plugin, topic = msg.topic(), reason = %reason, "plugin panicked");
                Dispatch::Failed {
                    plugin,
                    error: PluginError::Panicked(reason),
                }
            }
            Err(_elapsed) => {
                warn!(
                    plugin = %plugin,
                    topic = msg.topic(),
                    "plugin timed out after {:?}",
                    self.dispatch_timeout
                );
                Dispatch::TimedOut { plugin }
            }
        };
        histogram!("plugin_dispatch_duration_seconds").record(start.elapsed().as_secs_f64());
        outcome
    }

    /// Descriptor handling `topic`, if any.
    pub fn lookup(&self, topic: &str) -> Option<&PluginDescriptor> {
        self.routes.get(topic).map(|&i| &self.descriptors[i])
    }

    /// Registered descriptors in registration order.
    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    /// Registered descriptor with `id`.
    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.descriptors.iter().find(|d| d.identifier == id)
    }

    fn missing_dependencies(&self, descriptor: &PluginDescriptor) -> Vec<String> {
        let registered: HashSet<&str> =
            self.descriptors.iter().map(|d| d.identifier.as_str()).collect();
        descriptor
            .dependencies
            .iter()
            .filter(|dep| !registered.contains(dep.as_str()))
            .cloned()
            .collect()
    }

    /// All routable topics (sorted).
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_isolated(
    factory: &PluginFactory,
    env: &PluginEnv,
) -> Result<Arc<dyn Plugin>, RegistryError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| (factory.build)(env))) {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(err)) => Err(RegistryError::PluginInit {
            id: factory.id.to_owned(),
            reason: err.to_string(),
        }),
        Err(panic) => Err(RegistryError::PluginInit {
            id: factory.id.to_owned(),
            reason: format!("panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NullSessions, test_context};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use blum_core::SessionId;
    use serde_json::json;

    struct Fixed {
        id: &'static str,
        caps: Vec<Capability>,
    }

    #[async_trait]
    impl Plugin for Fixed {
        fn id(&self) -> &str {
            self.id
        }
        fn capabilities(&self) -> Vec<Capability> {
            self.caps.clone()
        }
        async fn handle(
            &self,
            _ctx: &PluginContext,
            msg: &Message,
        ) -> Result<Vec<Outgoing>, PluginError> {
            Ok(vec![Outgoing::new(msg.topic(), json!(self.id))])
        }
    }

    struct Misbehaving;

    #[async_trait]
    impl Plugin for Misbehaving {
        fn id(&self) -> &str {
            "misbehaving"
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![
                Capability::topic("fail"),
                Capability::topic("panic"),
                Capability::topic("hang"),
            ]
        }
        async fn handle(
            &self,
            _ctx: &PluginContext,
            msg: &Message,
        ) -> Result<Vec<Outgoing>, PluginError> {
            match msg.topic() {
                "fail" => Err(PluginError::Failed("nope".into())),
                "panic" => panic!("handler exploded"),
                _ => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(vec![])
                }
            }
        }
    }

    struct Dependent {
        id: &'static str,
        topic: &'static str,
        needs: &'static [&'static str],
    }

    #[async_trait]
    impl Plugin for Dependent {
        fn id(&self) -> &str {
            self.id
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::topic(self.topic)]
        }
        fn dependencies(&self) -> Vec<String> {
            self.needs.iter().map(|d| (*d).to_owned()).collect()
        }
        async fn handle(
            &self,
            _ctx: &PluginContext,
            _msg: &Message,
        ) -> Result<Vec<Outgoing>, PluginError> {
            Ok(vec![])
        }
    }

    fn build_needs_c(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Dependent {
            id: "needs-c",
            topic: "nc",
            needs: &["c"],
        }))
    }

    fn build_needs_ghost(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Dependent {
            id: "needs-ghost",
            topic: "ng",
            needs: &["ghost"],
        }))
    }

    fn build_needs_needs_ghost(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Dependent {
            id: "needs-needs-ghost",
            topic: "nng",
            needs: &["needs-ghost"],
        }))
    }

    fn build_ring_a(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Dependent {
            id: "ring-a",
            topic: "ra",
            needs: &["ring-b"],
        }))
    }

    fn build_ring_b(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Dependent {
            id: "ring-b",
            topic: "rb",
            needs: &["ring-a"],
        }))
    }

    fn fixed(id: &'static str, caps: Vec<Capability>) -> PluginDescriptor {
        PluginDescriptor::new(Arc::new(Fixed { id, caps }))
    }

    fn msg(topic: &str) -> Message {
        Message::new(SessionId::from("sess_t"), topic, json!(null), 1)
    }

    fn build_a(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Fixed {
            id: "a",
            caps: vec![Capability::topic("x")],
        }))
    }

    fn build_b_same_topic(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Fixed {
            id: "b",
            caps: vec![Capability::topic("x"), Capability::topic("y")],
        }))
    }

    fn build_c(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Ok(Arc::new(Fixed {
            id: "c",
            caps: vec![Capability::topic("z")],
        }))
    }

    fn build_err(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        Err(PluginError::Init("missing dependency".into()))
    }

    fn build_panics(_: &PluginEnv) -> Result<Arc<dyn Plugin>, PluginError> {
        panic!("constructor exploded")
    }

    #[test]
    fn duplicate_exclusive_capability_rejected() {
        let mut reg = PluginRegistry::new();
        reg.register(fixed("a", vec![Capability::topic("ping")])).unwrap();
        let err = reg
            .register(fixed("b", vec![Capability::topic("ping")]))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateCapability {
                tag: "ping".into(),
                owner: "a".into(),
                rejected: "b".into(),
            }
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn exclusive_blocks_shared_and_vice_versa() {
        let mut reg = PluginRegistry::new();
        reg.register(fixed("a", vec![Capability::shared("t")])).unwrap();
        assert!(reg.register(fixed("b", vec![Capability::topic("t")])).is_err());
        reg.register(fixed("c", vec![Capability::shared("t")])).unwrap();
        assert_eq!(reg.lookup("t").unwrap().identifier(), "a");
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut reg = PluginRegistry::new();
        reg.register(fixed("a", vec![Capability::topic("one")])).unwrap();
        assert_eq!(
            reg.register(fixed("a", vec![Capability::topic("two")])),
            Err(RegistryError::DuplicateId("a".into()))
        );
        assert!(reg.lookup("two").is_none());
    }

    #[test]
    fn discovery_keeps_others_when_one_collides() {
        let mut reg = PluginRegistry::new();
        let catalog = [
            PluginFactory::builtin("a", build_a),
            PluginFactory::builtin("b", build_b_same_topic),
            PluginFactory::builtin("c", build_c),
        ];
        let report = reg
            .discover(&catalog, &PluginScope::all(), &PluginEnv::default())
            .unwrap();

        assert_eq!(report.registered, vec!["a", "c"]);
        assert_matches!(
            report.failures.as_slice(),
            [RegistryError::DuplicateCapability { tag, .. }] if tag == "x"
        );
        // b's other capability is not half-registered.
        assert!(reg.lookup("y").is_none());
        assert_eq!(reg.topics(), vec!["x", "z"]);
    }

    #[test]
    fn failing_and_panicking_constructors_are_isolated() {
        let mut reg = PluginRegistry::new();
        let catalog = [
            PluginFactory::builtin("bad", build_err),
            PluginFactory::external("boom", build_panics),
            PluginFactory::builtin("c", build_c),
        ];
        let report = reg
            .discover(&catalog, &PluginScope::all(), &PluginEnv::default())
            .unwrap();
        assert_eq!(report.registered, vec!["c"]);
        assert_eq!(report.failures.len(), 2);
        assert_matches!(
            &report.failures[1],
            RegistryError::PluginInit { id, reason } if id == "boom" && reason.contains("constructor exploded")
        );
    }

    #[test]
    fn safe_mode_skips_external() {
        let mut reg = PluginRegistry::new();
        let catalog = [
            PluginFactory::external("a", build_a),
            PluginFactory::builtin("c", build_c),
        ];
        let report = reg
            .discover(
                &catalog,
                &PluginScope::all().with_safe_mode(true),
                &PluginEnv::default(),
            )
            .unwrap();
        assert_eq!(report.registered, vec!["c"]);
        assert_eq!(report.skipped, vec![("a".to_string(), "safe mode")]);
    }

    #[test]
    fn dependents_register_after_their_dependencies() {
        let mut reg = PluginRegistry::new();
        let catalog = [
            PluginFactory::builtin("needs-c", build_needs_c),
            PluginFactory::builtin("a", build_a),
            PluginFactory::builtin("c", build_c),
        ];
        let report = reg
            .discover(&catalog, &PluginScope::all(), &PluginEnv::default())
            .unwrap();
        assert_eq!(report.registered, vec!["a", "c", "needs-c"]);
        assert!(report.failures.is_empty());
        assert_eq!(reg.get("needs-c").unwrap().dependencies(), ["c"]);
    }

    #[test]
    fn unsatisfied_dependencies_are_reported_transitively() {
        let mut reg = PluginRegistry::new();
        let catalog = [
            PluginFactory::builtin("needs-needs-ghost", build_needs_needs_ghost),
            PluginFactory::builtin("needs-ghost", build_needs_ghost),
            PluginFactory::builtin("c", build_c),
        ];
        let report = reg
            .discover(&catalog, &PluginScope::all(), &PluginEnv::default())
            .unwrap();
        assert_eq!(report.registered, vec!["c"]);
        assert_eq!(
            report.failures,
            vec![
                RegistryError::UnsatisfiedDependencies {
                    id: "needs-needs-ghost".into(),
                    missing: vec!["needs-ghost".into()],
                },
                RegistryError::UnsatisfiedDependencies {
                    id: "needs-ghost".into(),
                    missing: vec!["ghost".into()],
                },
            ]
        );
        assert!(reg.lookup("ng").is_none());
    }

    #[test]
    fn dependency_cycle_registers_neither() {
        let mut reg = PluginRegistry::new();
        let catalog = [
            PluginFactory::builtin("ring-a", build_ring_a),
            PluginFactory::builtin("ring-b", build_ring_b),
        ];
        let report = reg
            .discover(&catalog, &PluginScope::all(), &PluginEnv::default())
            .unwrap();
        assert!(report.registered.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn manual_register_checks_dependencies() {
        let mut reg = PluginRegistry::new();
        let dependent = PluginDescriptor::new(build_needs_c(&PluginEnv::default()).unwrap());
        assert_matches!(
            reg.register(dependent.clone()),
            Err(RegistryError::UnsatisfiedDependencies { id, .. }) if id == "needs-c"
        );
        reg.register(fixed("c", vec![Capability::topic("z")])).unwrap();
        reg.register(dependent).unwrap();
        assert_eq!(reg.get("needs-c").unwrap().state(), PluginState::Registered);
    }

    #[test]
    fn discovery_runs_once() {
        let mut reg = PluginRegistry::new();
        let env = PluginEnv::default();
        let _ = reg.discover(&[], &PluginScope::all(), &env).unwrap();
        assert_eq!(
            reg.discover(&[], &PluginScope::all(), &env),
            Err(RegistryError::AlreadyDiscovered)
        );
    }

    #[tokio::test]
    async fn dispatch_routes_to_owner() {
        let mut reg = PluginRegistry::new();
        reg.register(fixed("a", vec![Capability::topic("x")])).unwrap();
        reg.register(fixed("b", vec![Capability::topic("y")])).unwrap();
        let ctx = test_context(Arc::new(NullSessions));

        match reg.dispatch(&ctx, &msg("y")).await {
            Dispatch::Handled { plugin, replies } => {
                assert_eq!(plugin, "b");
                assert_eq!(replies[0].payload, json!("b"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_topic_is_unhandled() {
        let reg = PluginRegistry::new();
        let ctx = test_context(Arc::new(NullSessions));
        let outcome = reg.dispatch(&ctx, &msg("nobody")).await;
        assert!(!outcome.handled());
    }

    #[tokio::test]
    async fn dispatch_contains_errors_and_panics() {
        let mut reg = PluginRegistry::new();
        reg.register(PluginDescriptor::new(Arc::new(Misbehaving))).unwrap();
        let ctx = test_context(Arc::new(NullSessions));

        assert_matches!(
            reg.dispatch(&ctx, &msg("fail")).await,
            Dispatch::Failed { error: PluginError::Failed(_), .. }
        );
        assert_matches!(
            reg.dispatch(&ctx, &msg("panic")).await,
            Dispatch::Failed { error: PluginError::Panicked(reason), .. } if reason == "handler exploded"
        );
    }

    #[tokio::test]
    async fn dispatch_refuses_plugins_that_are_not_running() {
        let mut reg = PluginRegistry::new();
        reg.register(fixed("a", vec![Capability::topic("x")])).unwrap();
        let ctx = test_context(Arc::new(NullSessions));

        reg.get("a").unwrap().set_state(PluginState::Running);
        assert_matches!(reg.dispatch(&ctx, &msg("x")).await, Dispatch::Handled { .. });

        for state in [PluginState::Failed, PluginState::Stopped] {
            reg.get("a").unwrap().set_state(state);
            assert_matches!(
                reg.dispatch(&ctx, &msg("x")).await,
                Dispatch::Failed { error: PluginError::Unavailable(id), .. } if id == "a"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out() {
        let mut reg = PluginRegistry::with_dispatch_timeout(Duration::from_millis(50));
        reg.register(PluginDescriptor::new(Arc::new(Misbehaving))).unwrap();
        let ctx = test_context(Arc::new(NullSessions));
        assert_matches!(
            reg.dispatch(&ctx, &msg("hang")).await,
            Dispatch::TimedOut { plugin } if plugin == "misbehaving"
        );
    }
}
