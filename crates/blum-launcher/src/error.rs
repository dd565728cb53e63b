//! Launcher error type.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::ChildExit;

/// Errors raised while locating, starting, or signalling the service.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// No service executable at any candidate location.
    #[error("service binary not found (searched: {})", join_paths(.searched))]
    BinaryNotFound {
        /// Candidate paths, in search order.
        searched: Vec<PathBuf>,
    },
    /// The OS refused to start the process.
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        /// Executable.
        program: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The child did not signal readiness in time.
    #[error("service not ready within {timeout:?}")]
    StartupTimeout {
        /// Configured startup deadline.
        timeout: Duration,
    },
    /// The child exited before signalling readiness.
    #[error("service exited during startup ({exit})")]
    ExitedDuringStartup {
        /// How it exited.
        exit: ChildExit,
    },
    /// Delivering a signal failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target process.
        pid: u32,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Waiting on the child failed.
    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
