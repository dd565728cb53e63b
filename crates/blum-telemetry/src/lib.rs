//! # blum-telemetry
//!
//! Installs the `tracing` subscriber for a blum process. Call
//! [`init_logging`] once, first thing in `main`.

#![deny(unsafe_code)]

use blum_settings::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Telemetry setup failures.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The level or directive string could not be parsed.
    #[error("invalid log filter {directive:?}: {detail}")]
    InvalidFilter {
        /// Rejected directive.
        directive: String,
        /// Parser message.
        detail: String,
    },
    /// A global subscriber is already installed.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Directive used when `RUST_LOG` is absent. `--debug` forces `debug`.
pub fn default_directive(settings: &LoggingSettings, debug: bool) -> String {
    if debug {
        "debug".to_string()
    } else {
        settings.level.to_lowercase()
    }
}

/// Build the level filter.
///
/// `--debug` wins over everything; otherwise `RUST_LOG` wins over the
/// configured level.
pub fn build_filter(settings: &LoggingSettings, debug: bool) -> Result<EnvFilter, TelemetryError> {
    let directive = default_directive(settings, debug);
    if !debug {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(&directive).map_err(|e| TelemetryError::InvalidFilter {
        directive,
        detail: e.to_string(),
    })
}

/// Install the global subscriber writing to stderr.
pub fn init_logging(settings: &LoggingSettings, debug: bool) -> Result<(), TelemetryError> {
    let env_filter = build_filter(settings, debug)?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}
