//! Supervisor behavior against a scripted fake spawner, on paused time.

#![allow(unused_results)]

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use blum_launcher::{
    ChildExit, ChildHandle, LaunchError, LaunchSpec, ProcessState, Readiness, RestartPolicy,
    Spawner, Supervisor, SupervisorOutcome,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// How one fake child behaves.
#[derive(Clone, Copy, Debug)]
struct Script {
    ready: bool,
    exit_after: Option<Duration>,
    code: i32,
    ignores_term: bool,
}

impl Script {
    fn crash_after(ms: u64) -> Self {
        Self {
            ready: true,
            exit_after: Some(Duration::from_millis(ms)),
            code: 1,
            ignores_term: false,
        }
    }

    fn long_running() -> Self {
        Self {
            ready: true,
            exit_after: None,
            code: 0,
            ignores_term: false,
        }
    }
}

#[derive(Default)]
struct Shared {
    spawns: Mutex<Vec<(u32, Instant)>>,
    terminated: Mutex<Vec<u32>>,
    ready: Mutex<HashSet<u32>>,
}

struct FakeSpawner {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    fail_spawn: bool,
    next_pid: AtomicU32,
    shared: Arc<Shared>,
}

impl FakeSpawner {
    fn new(fallback: Script, shared: &Arc<Shared>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            fail_spawn: false,
            next_pid: AtomicU32::new(100),
            shared: Arc::clone(shared),
        }
    }

    fn then(self, script: Script) -> Self {
        self.scripts.lock().push_back(script);
        self
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildHandle>, LaunchError> {
        if self.fail_spawn {
            return Err(LaunchError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::other("exec format error"),
            });
        }
        let script = self.scripts.lock().pop_front().unwrap_or(self.fallback);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        self.shared.spawns.lock().push((pid, now));
        if script.ready {
            self.shared.ready.lock().insert(pid);
        }
        let (signals, signal_rx) = watch::channel(None);
        Ok(Box::new(FakeChild {
            pid,
            exit_at: script.exit_after.map(|d| now + d),
            script,
            signals,
            signal_rx,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeChild {
    pid: u32,
    exit_at: Option<Instant>,
    script: Script,
    signals: watch::Sender<Option<ChildExit>>,
    signal_rx: watch::Receiver<Option<ChildExit>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl ChildHandle for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ChildExit, LaunchError> {
        loop {
            if let Some(exit) = *self.signal_rx.borrow_and_update() {
                return Ok(exit);
            }
            match self.exit_at {
                Some(at) => tokio::select! {
                    () = tokio::time::sleep_until(at) => return Ok(ChildExit::code(self.script.code)),
                    _ = self.signal_rx.changed() => {}
                },
                None => {
                    let _ = self.signal_rx.changed().await;
                }
            }
        }
    }

    fn terminate(&mut self) -> Result<(), LaunchError> {
        self.shared.terminated.lock().push(self.pid);
        if !self.script.ignores_term {
            self.signals.send_replace(Some(ChildExit::signalled(SIGTERM)));
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.signals.send_replace(Some(ChildExit::signalled(SIGKILL)));
        Ok(())
    }
}

struct FakeReadiness(Arc<Shared>);

#[async_trait]
impl Readiness for FakeReadiness {
    async fn is_ready(&self, pid: Option<u32>, _spawned_at: DateTime<Utc>) -> bool {
        pid.is_some_and(|pid| self.0.ready.lock().contains(&pid))
    }
}

fn policy(max_restarts: u32) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(300),
        stable_after: Duration::from_secs(60),
        restart_on_clean_exit: false,
        startup_timeout: Duration::from_secs(1),
        probe_interval: Duration::from_millis(10),
        grace_period: Duration::from_secs(2),
    }
}

fn supervisor(spawner: FakeSpawner, policy: RestartPolicy, shared: &Arc<Shared>) -> Supervisor {
    let spec = LaunchSpec {
        program: PathBuf::from("/opt/blum/blum-service"),
        args: Vec::new(),
    };
    Supervisor::new(
        spec,
        policy,
        Arc::new(spawner),
        Arc::new(FakeReadiness(Arc::clone(shared))),
    )
}

fn spawn_gaps(shared: &Shared) -> Vec<Duration> {
    let spawns = shared.spawns.lock();
    spawns.windows(2).map(|w| w[1].1 - w[0].1).collect()
}

#[tokio::test(start_paused = true)]
async fn crash_loop_backs_off_then_fails() {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner::new(Script::crash_after(10), &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);

    let outcome = sup.monitor(CancellationToken::new()).await;

    assert_eq!(outcome, SupervisorOutcome::Failed);
    assert_eq!(outcome.exit_code(), 1);
    let status = sup.status();
    assert_eq!(status.state, ProcessState::Failed);
    assert_eq!(status.restarts, 3);
    assert_eq!(status.last_exit, Some(ChildExit::code(1)));
    // Initial start plus three restarts; delays 100, 200, then capped at 300.
    assert_eq!(
        spawn_gaps(&shared),
        vec![
            Duration::from_millis(110),
            Duration::from_millis(210),
            Duration::from_millis(310),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn zero_restarts_fails_on_first_crash() {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner::new(Script::crash_after(10), &shared);
    let mut sup = supervisor(spawner, policy(0), &shared);

    assert_eq!(sup.monitor(CancellationToken::new()).await, SupervisorOutcome::Failed);
    assert_eq!(shared.spawns.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stable_run_resets_restart_counter() {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner::new(Script::crash_after(1_000), &shared);
    let mut restart_policy = policy(1);
    restart_policy.stable_after = Duration::from_millis(500);
    let mut sup = supervisor(spawner, restart_policy, &shared);

    let shutdown = CancellationToken::new();
    let stopper = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5_050)).await;
            shutdown.cancel();
        })
    };

    // With a limit of 1 the supervisor would fail on the second crash if the
    // counter never reset.
    let outcome = sup.monitor(shutdown).await;
    stopper.await.unwrap();

    assert_eq!(outcome, SupervisorOutcome::Stopped);
    assert!(shared.spawns.lock().len() >= 5);
    assert!(
        spawn_gaps(&shared)
            .iter()
            .all(|gap| *gap == Duration::from_millis(1_100))
    );
    assert_eq!(sup.status().state, ProcessState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn clean_exit_is_not_restarted() {
    let shared = Arc::new(Shared::default());
    let clean = Script {
        code: 0,
        ..Script::crash_after(50)
    };
    let spawner = FakeSpawner::new(clean, &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);

    let outcome = sup.monitor(CancellationToken::new()).await;
    assert_eq!(outcome, SupervisorOutcome::Exited(ChildExit::code(0)));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(shared.spawns.lock().len(), 1);
    assert_eq!(sup.status().state, ProcessState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn clean_exit_restarts_when_configured() {
    let shared = Arc::new(Shared::default());
    let clean = Script {
        code: 0,
        ..Script::crash_after(50)
    };
    let spawner = FakeSpawner::new(clean, &shared);
    let mut restart_policy = policy(2);
    restart_policy.restart_on_clean_exit = true;
    let mut sup = supervisor(spawner, restart_policy, &shared);

    assert_eq!(sup.monitor(CancellationToken::new()).await, SupervisorOutcome::Failed);
    assert_eq!(shared.spawns.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn start_reaches_running() {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner::new(Script::long_running(), &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);

    let status = sup.start().await.unwrap();
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.pid, Some(100));

    let exit = sup.stop().await;
    assert_eq!(exit, Some(ChildExit::signalled(SIGTERM)));
    assert_eq!(sup.status().state, ProcessState::Stopped);
    assert_eq!(*shared.terminated.lock(), vec![100]);
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_stops_the_child() {
    let shared = Arc::new(Shared::default());
    let never_ready = Script {
        ready: false,
        ..Script::long_running()
    };
    let spawner = FakeSpawner::new(never_ready, &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);

    let started = Instant::now();
    let err = sup.start().await.unwrap_err();
    assert_matches!(err, LaunchError::StartupTimeout { .. });
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(*shared.terminated.lock(), vec![100]);
    assert!(sup.status().pid.is_none());
}

#[tokio::test(start_paused = true)]
async fn exit_during_startup_is_reported() {
    let shared = Arc::new(Shared::default());
    let dies = Script {
        ready: false,
        ..Script::crash_after(20)
    };
    let spawner = FakeSpawner::new(dies, &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);

    let err = sup.start().await.unwrap_err();
    assert_matches!(err, LaunchError::ExitedDuringStartup { exit } if exit == ChildExit::code(1));
    assert!(shared.terminated.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_start_counts_toward_limit() {
    let shared = Arc::new(Shared::default());
    let never_ready = Script {
        ready: false,
        ..Script::long_running()
    };
    let spawner = FakeSpawner::new(never_ready, &shared);
    let mut sup = supervisor(spawner, policy(1), &shared);

    assert_eq!(sup.monitor(CancellationToken::new()).await, SupervisorOutcome::Failed);
    assert_eq!(shared.spawns.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn spawn_errors_count_toward_limit() {
    let shared = Arc::new(Shared::default());
    let mut spawner = FakeSpawner::new(Script::long_running(), &shared);
    spawner.fail_spawn = true;
    let mut sup = supervisor(spawner, policy(2), &shared);

    assert_eq!(sup.monitor(CancellationToken::new()).await, SupervisorOutcome::Failed);
    assert_eq!(sup.status().restarts, 2);
}

#[tokio::test(start_paused = true)]
async fn stop_kills_after_grace_period() {
    let shared = Arc::new(Shared::default());
    let stubborn = Script {
        ignores_term: true,
        ..Script::long_running()
    };
    let spawner = FakeSpawner::new(stubborn, &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);
    sup.start().await.unwrap();

    let started = Instant::now();
    let exit = sup.stop().await;
    assert_eq!(exit, Some(ChildExit::signalled(SIGKILL)));
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_stops() {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner::new(Script::long_running(), &shared).then(Script::crash_after(10));
    let mut restart_policy = policy(3);
    restart_policy.initial_backoff = Duration::from_secs(30);
    restart_policy.max_backoff = Duration::from_secs(30);
    let mut sup = supervisor(spawner, restart_policy, &shared);

    let shutdown = CancellationToken::new();
    let mut status = sup.subscribe();
    let canceller = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            status
                .wait_for(|s| s.state == ProcessState::Restarting)
                .await
                .unwrap();
            shutdown.cancel();
        })
    };

    assert_eq!(sup.monitor(shutdown).await, SupervisorOutcome::Stopped);
    canceller.await.unwrap();
    assert_eq!(shared.spawns.lock().len(), 1);
    assert_eq!(sup.status().state, ProcessState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_running_stops_gracefully() {
    let shared = Arc::new(Shared::default());
    let spawner = FakeSpawner::new(Script::long_running(), &shared);
    let mut sup = supervisor(spawner, policy(3), &shared);

    let shutdown = CancellationToken::new();
    let mut status = sup.subscribe();
    let canceller = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            status
                .wait_for(|s| s.state == ProcessState::Running)
                .await
                .unwrap();
            shutdown.cancel();
        })
    };

    let outcome = sup.monitor(shutdown).await;
    canceller.await.unwrap();
    assert_eq!(outcome, SupervisorOutcome::Stopped);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(*shared.terminated.lock(), vec![100]);
    assert_eq!(sup.status().last_exit, Some(ChildExit::signalled(SIGTERM)));
}
