//! Child process abstraction.
//!
//! [`Spawner`] and [`ChildHandle`] let the supervisor run against real
//! processes ([`TokioSpawner`]) or scripted fakes in tests.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::LaunchError;

/// What to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
}

/// How a child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit status, when the child exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when killed by one.
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Normal exit with `code`.
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Killed by `signal`.
    pub fn signalled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// A running child.
#[async_trait]
pub trait ChildHandle: Send {
    /// OS process id, while known.
    fn pid(&self) -> Option<u32>;

    /// Wait for the child to exit. Cancel-safe.
    async fn wait(&mut self) -> Result<ChildExit, LaunchError>;

    /// Ask the child to terminate gracefully (SIGTERM).
    fn terminate(&mut self) -> Result<(), LaunchError>;

    /// Force the child to stop (SIGKILL).
    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// Starts children.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start `spec`.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildHandle>, LaunchError>;
}

/// Spawns real OS processes with inherited stdio.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSpawner;

#[async_trait]
impl Spawner for TokioSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildHandle>, LaunchError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        info!(pid = ?child.id(), program = %spec.program.display(), "service spawned");
        Ok(Box::new(TokioChild { child }))
    }
}

struct TokioChild {
    child: Child,
}

#[async_trait]
impl ChildHandle for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ChildExit, LaunchError> {
        self.child
            .wait()
            .await
            .map(ChildExit::from)
            .map_err(LaunchError::Wait)
    }

    fn terminate(&mut self) -> Result<(), LaunchError> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        debug!(pid, "sending SIGTERM");
        send_sigterm(pid)
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.child.kill().await.map_err(LaunchError::Wait)
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_sigterm(pid: u32) -> Result<(), LaunchError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| LaunchError::Signal {
        pid,
        source: std::io::Error::other("pid out of range"),
    })?;
    // SAFETY: `kill(2)` takes plain integers and touches no memory owned by
    // this process; an invalid pid only yields an error return.
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(LaunchError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn send_sigterm(pid: u32) -> Result<(), LaunchError> {
    Err(LaunchError::Signal {
        pid,
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "no SIGTERM on this platform"),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[test]
    fn exit_display() {
        assert_eq!(ChildExit::code(3).to_string(), "exit status 3");
        assert_eq!(ChildExit::signalled(15).to_string(), "signal 15");
        assert!(ChildExit::code(0).success());
        assert!(!ChildExit::signalled(9).success());
    }

    #[tokio::test]
    async fn real_child_exit_code() {
        let mut child = TokioSpawner.spawn(&sh("exit 4")).await.unwrap();
        assert_eq!(child.wait().await.unwrap(), ChildExit::code(4));
    }

    #[tokio::test]
    async fn sigterm_stops_real_child() {
        let mut child = TokioSpawner.spawn(&sh("exec sleep 30")).await.unwrap();
        assert!(child.pid().is_some());
        child.terminate().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn spawn_failure_names_program() {
        let spec = LaunchSpec {
            program: PathBuf::from("/definitely/not/here"),
            args: Vec::new(),
        };
        let Err(err) = TokioSpawner.spawn(&spec).await else {
            panic!("spawn should fail");
        };
        assert!(err.to_string().contains("/definitely/not/here"));
    }
}
