//! # blumcore launcher
//!
//! Locates the `blum-service` executable, runs it as a child, and keeps it
//! alive:
//!
//! - [`resolve_binary`]: find the service next to the launcher
//! - [`Supervisor`]: start, readiness wait, restart with capped exponential
//!   backoff, terminal `Failed` state, two-phase stop
//! - [`ReadinessProbe`]: ready file or TCP connect

#![deny(unsafe_code)]

pub mod binary;
pub mod error;
pub mod policy;
pub mod probe;
pub mod process;
pub mod supervisor;

pub use binary::{SERVICE_BINARY, resolve_binary, resolve_binary_from};
pub use error::LaunchError;
pub use policy::RestartPolicy;
pub use probe::{Readiness, ReadinessProbe};
pub use process::{ChildExit, ChildHandle, LaunchSpec, Spawner, TokioSpawner};
pub use supervisor::{ProcessState, SupervisedProcess, Supervisor, SupervisorOutcome};
