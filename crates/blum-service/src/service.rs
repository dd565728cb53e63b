//! Startup and shutdown sequencing for the service process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blum_plugins::{
    HostContext, PluginEnv, PluginHost, PluginRegistry, PluginScope, StartReport, builtin_catalog,
};
use blum_server::{
    BlumServer, ReadySignal, ServerConfig, SessionJournal, remove_ready_file, write_ready_file,
};
use blum_settings::BlumSettings;
use blum_store::{Database, RecordStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bound on draining sessions and the listener at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A started service: plugins running, listening, ready file written.
pub struct Service {
    server: Arc<BlumServer>,
    plugins: PluginHost,
    started: StartReport,
    store: RecordStore,
    addr: SocketAddr,
    handle: JoinHandle<()>,
    ready_file: PathBuf,
    recovered: usize,
}

impl Service {
    /// Open the store, close journal entries left by a crashed process,
    /// discover and start plugins, bind, and write the ready file.
    ///
    /// Store and bind failures are fatal. Plugin failures only exclude the
    /// offending plugin.
    pub async fn start(settings: &BlumSettings) -> Result<Self> {
        let db = Database::open(&settings.store.path).with_context(|| {
            format!("Failed to open store at {}", settings.store.path.display())
        })?;
        let store = RecordStore::new(db);

        let journal_store = store.clone();
        let retention = settings.server.journal_retention;
        let recovered = tokio::task::spawn_blocking(move || {
            SessionJournal::with_retention(journal_store, retention).recover()
        })
        .await
        .context("Session journal recovery panicked")?
        .context("Failed to recover session journal")?;
        if recovered > 0 {
            warn!(recovered, "closed sessions abandoned by a previous run");
        }

        let mut registry = PluginRegistry::with_dispatch_timeout(settings.server.dispatch_timeout());
        let report = registry
            .discover(
                &builtin_catalog(),
                &PluginScope::from_settings(&settings.plugins),
                &PluginEnv::default(),
            )
            .context("Plugin discovery failed")?;
        info!(
            plugins = ?report.registered,
            topics = ?registry.topics(),
            "plugins ready"
        );

        let registry = Arc::new(registry);
        let server = Arc::new(BlumServer::new(
            ServerConfig::from(&settings.server),
            Arc::clone(&registry),
            store.clone(),
        ));

        let mut plugins = PluginHost::new(
            registry,
            HostContext {
                store: store.clone(),
                sessions: Arc::new(server.sessions().clone()),
            },
        );
        let started = plugins.start_all().await;
        for (plugin, reason) in &started.failed {
            warn!(plugin = %plugin, reason = %reason, "plugin unavailable");
        }

        let (addr, handle) = match server.listen().await {
            Ok(bound) => bound,
            Err(err) => {
                plugins.stop_all().await;
                return Err(err).context("Failed to start server");
            }
        };

        if let Err(err) = write_ready_file(&settings.ready_file, &ReadySignal::now(addr)) {
            let _ = server.drain(handle, SHUTDOWN_TIMEOUT).await;
            plugins.stop_all().await;
            return Err(err).with_context(|| {
                format!(
                    "Failed to write ready file {}",
                    settings.ready_file.display()
                )
            });
        }

        Ok(Self {
            server,
            plugins,
            started,
            store,
            addr,
            handle,
            ready_file: settings.ready_file.clone(),
            recovered,
        })
    }

    /// Bound listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Journal entries closed as abandoned during startup.
    pub fn recovered(&self) -> usize {
        self.recovered
    }

    /// Which plugins started and which did not.
    pub fn plugins_started(&self) -> &StartReport {
        &self.started
    }

    /// Cancel plugin tasks, close every session with `ServerShutdown`, stop
    /// the listener, stop plugins in reverse order, checkpoint the store,
    /// and remove the ready file.
    pub async fn shutdown(mut self) -> Result<()> {
        self.plugins.cancel_tasks().await;
        if !self.server.drain(self.handle, SHUTDOWN_TIMEOUT).await {
            warn!("server did not drain within {SHUTDOWN_TIMEOUT:?}");
        }
        self.plugins.stop_all().await;
        if let Err(err) = self.store.database().checkpoint() {
            warn!(error = %err, "store checkpoint failed");
        }
        remove_ready_file(&self.ready_file).with_context(|| {
            format!("Failed to remove ready file {}", self.ready_file.display())
        })?;
        Ok(())
    }
}
