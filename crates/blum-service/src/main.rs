//! # blum-service
//!
//! The supervised service: opens the store, discovers plugins, serves
//! WebSocket sessions, and signals readiness to the launcher.

#![deny(unsafe_code)]

mod service;

use std::path::PathBuf;

use anyhow::{Context, Result};
use blum_settings::{BlumSettings, LoadedSettings};
use clap::Parser;

use crate::service::Service;

/// blum WebSocket service.
#[derive(Parser, Debug)]
#[command(name = "blum-service", about = "blum WebSocket service", version)]
struct Cli {
    /// Settings file (defaults to `~/blumcore/configuration/core.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force debug logging.
    #[arg(long)]
    debug: bool,

    /// Skip external plugins.
    #[arg(long)]
    safe_mode: bool,

    /// Tokio worker threads.
    #[arg(long, default_value_t = 2)]
    worker_threads: usize,

    /// Listen address (overrides `server.bind`).
    #[arg(long)]
    bind: Option<String>,

    /// Database file (overrides `store.path`).
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Ready file written once listening (overrides `readyFile`).
    #[arg(long)]
    ready_file: Option<PathBuf>,
}

impl Cli {
    /// File and environment layers plus flags. Validation happens at
    /// [`blum_settings::init_settings`], after every layer is in.
    fn load_settings(&self) -> Result<LoadedSettings> {
        let mut loaded = match &self.config {
            Some(path) => blum_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => blum_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply(&mut loaded.settings);
        Ok(loaded)
    }

    /// Command-line flags win over file and environment.
    fn apply(&self, settings: &mut BlumSettings) {
        if let Some(bind) = &self.bind {
            settings.server.bind.clone_from(bind);
        }
        if let Some(path) = &self.store_path {
            settings.store.path.clone_from(path);
        }
        if let Some(path) = &self.ready_file {
            settings.ready_file.clone_from(path);
        }
        if self.safe_mode {
            settings.plugins.safe_mode = true;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.worker_threads.max(1))
        .thread_name("blum-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let LoadedSettings { settings, warnings } = cli.load_settings()?;
    let settings = blum_settings::init_settings(settings).context("Invalid settings")?;
    blum_telemetry::init_logging(&settings.logging, cli.debug)
        .context("Failed to initialize logging")?;
    blum_settings::log_env_warnings(&warnings);

    let service = Service::start(settings).await?;
    tracing::info!(
        addr = %service.addr(),
        pid = std::process::id(),
        recovered = service.recovered(),
        "blum service ready"
    );

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down...");
    service.shutdown().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
