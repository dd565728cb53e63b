//! `blumcore`: launches and supervises the blum service.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use blum_launcher::{
    LaunchError, LaunchSpec, ReadinessProbe, RestartPolicy, Supervisor, TokioSpawner,
    resolve_binary,
};
use blum_settings::LoadedSettings;
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Exit status for configuration and usage problems.
const EXIT_USAGE: u8 = 2;

/// blum launcher.
#[derive(Parser, Debug)]
#[command(name = "blumcore", about = "Launches and supervises the blum service", version)]
struct Cli {
    /// Settings file (defaults to `~/blumcore/configuration/core.json`).
    /// Also passed to the service.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging.
    #[arg(long)]
    debug: bool,

    /// Service executable (overrides `launcher.serviceBinary`).
    #[arg(long)]
    service_binary: Option<PathBuf>,

    /// Restart limit (overrides `launcher.maxRestarts`).
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Arguments forwarded to the service.
    #[arg(last = true)]
    service_args: Vec<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<LoadedSettings> {
        let mut loaded = match &self.config {
            Some(path) => blum_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => blum_settings::load_settings().context("Failed to load settings")?,
        };
        let settings = &mut loaded.settings;
        if let Some(path) = &self.service_binary {
            settings.launcher.service_binary = Some(path.clone());
        }
        if let Some(max) = self.max_restarts {
            settings.launcher.max_restarts = max;
        }
        Ok(loaded)
    }

    /// Service command line: forwarded args, then what the probe needs.
    fn service_args(&self, probe: &ReadinessProbe) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        args.extend(self.service_args.iter().cloned());
        args.extend(probe.service_args());
        args
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (settings, warnings) = match cli.load_settings().and_then(|loaded| {
        let settings = blum_settings::init_settings(loaded.settings).context("Invalid settings")?;
        Ok((settings, loaded.warnings))
    }) {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("blumcore: {err:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    if let Err(err) = blum_telemetry::init_logging(&settings.logging, cli.debug) {
        eprintln!("blumcore: {err}");
        return ExitCode::FAILURE;
    }
    blum_settings::log_env_warnings(&warnings);

    let program = match resolve_binary(settings.launcher.service_binary.as_deref()) {
        Ok(path) => path,
        Err(err @ LaunchError::BinaryNotFound { .. }) => {
            tracing::error!(error = %err, "cannot start without the service binary");
            return ExitCode::from(EXIT_USAGE);
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to resolve service binary");
            return ExitCode::FAILURE;
        }
    };

    let probe = ReadinessProbe::from_settings(&settings.launcher.probe, &settings.ready_file);
    let spec = LaunchSpec {
        program,
        args: cli.service_args(&probe),
    };
    tracing::info!(program = %spec.program.display(), args = ?spec.args, "blumcore starting");

    let mut supervisor = Supervisor::new(
        spec,
        RestartPolicy::from(&settings.launcher),
        Arc::new(TokioSpawner),
        Arc::new(probe),
    );

    let shutdown = CancellationToken::new();
    let _signals = tokio::spawn(forward_signals(shutdown.clone()));
    let outcome = supervisor.monitor(shutdown).await;

    tracing::info!(?outcome, state = %supervisor.status().state, "blumcore exiting");
    ExitCode::from(outcome.exit_code())
}

/// Cancel `shutdown` on SIGINT or SIGTERM; the supervisor then stops the
/// child in two phases.
async fn forward_signals(shutdown: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::warn!(error = %err, "ctrl-c handler failed");
                return;
            }
        }
        () = terminate_requested() => {}
    }
    tracing::info!("stop requested");
    shutdown.cancel();
}

/// Resolves on SIGTERM. Never resolves where SIGTERM does not exist or the
/// handler cannot be installed.
#[cfg(unix)]
async fn terminate_requested() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            let _ = stream.recv().await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_requested() {
    std::future::pending::<()>().await;
}
