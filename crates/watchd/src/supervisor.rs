//! Process supervisor: keeps the worker (API or test server) alive 24/7.
//!
//! A liveness loop around one long-running worker process. Health is the
//! worker answering on its TCP port; the PID file only identifies which
//! process to adopt or terminate. Starting is idempotent: if the port is
//! already served by a live process, the supervisor adopts it rather than
//! spawning a duplicate. Crash recovery is bounded — after too many
//! restarts inside the accounting window the supervisor parks in a
//! terminal FAILED state and leaves the rest to the operator.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use watch_core::config::SupervisorConfig;

use crate::process::{self, ProcessError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("empty worker command")]
    EmptyCommand,
    #[error("worker failed permanently after {restarts} restarts within the window")]
    WorkerFailed { restarts: usize },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Lifecycle of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
    /// Terminal: restart budget exhausted, operator intervention required.
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Crashed => "CRASHED",
            Self::Restarting => "RESTARTING",
            Self::Failed => "FAILED",
        }
    }
}

/// Check whether something is listening on the worker port.
pub async fn port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Supervisor for one worker process.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    state: WorkerState,
    /// Child handle when this supervisor spawned the worker; None for an
    /// adopted worker, which is tracked via port and PID file only.
    child: Option<Child>,
    /// Spawn times inside the restart accounting window.
    restarts: VecDeque<Instant>,
    consecutive_failures: u32,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: WorkerState::Stopped,
            child: None,
            restarts: VecDeque::new(),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run the liveness loop until cancelled or the restart budget runs out.
    ///
    /// On cancellation the worker is terminated and its PID file removed in
    /// the same shutdown step, so no orphan survives the supervisor.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.config.worker_cmd.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }

        info!(
            port = self.config.port,
            interval_sec = self.config.check_interval_sec,
            max_restarts = self.config.max_restarts,
            "supervisor started"
        );

        // A PID file left by a previous supervisor is only trusted if it
        // names a live process.
        process::validate_pid_file(&self.config.pid_file)?;
        self.ensure_started().await?;

        let interval = Duration::from_secs(self.config.check_interval_sec);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("supervisor cancelled, stopping worker");
                    self.shutdown_worker().await?;
                    self.state = WorkerState::Stopped;
                    return Ok(());
                }
                () = tokio::time::sleep(interval) => {}
            }

            if self.health_ok().await {
                if self.state != WorkerState::Running {
                    info!("worker is healthy");
                }
                self.state = WorkerState::Running;
                self.consecutive_failures = 0;
                continue;
            }

            self.consecutive_failures += 1;
            self.state = WorkerState::Crashed;
            warn!(
                failures = self.consecutive_failures,
                threshold = self.config.failure_threshold,
                "worker health check failed"
            );

            // Give a slow startup a chance before restarting.
            if self.consecutive_failures < self.config.failure_threshold {
                continue;
            }

            if !self.can_restart() {
                error!(
                    restarts = self.restarts.len(),
                    window_sec = self.config.restart_window_sec,
                    "restart budget exhausted, giving up"
                );
                self.state = WorkerState::Failed;
                return Err(SupervisorError::WorkerFailed {
                    restarts: self.restarts.len(),
                });
            }

            self.state = WorkerState::Restarting;
            info!("restarting worker");
            self.shutdown_worker().await?;
            self.ensure_started().await?;
            self.consecutive_failures = 0;
        }
    }

    /// Start the worker unless one is already serving.
    ///
    /// Returns true when a new process was spawned. Starting twice must
    /// never produce two workers: a live port (or a live PID-file process)
    /// means the worker is adopted as RUNNING instead.
    pub async fn ensure_started(&mut self) -> Result<bool> {
        if port_in_use(self.config.port).await {
            info!(port = self.config.port, "worker already serving, adopting");
            self.state = WorkerState::Running;
            return Ok(false);
        }

        if let Some(pid) = process::validate_pid_file(&self.config.pid_file)? {
            // Process exists but the port is not answering yet; treat it as
            // still starting rather than spawning a duplicate.
            info!(pid, "worker process alive, waiting for port");
            self.state = WorkerState::Starting;
            return Ok(false);
        }

        self.spawn_worker().await?;
        Ok(true)
    }

    async fn spawn_worker(&mut self) -> Result<()> {
        self.state = WorkerState::Starting;

        let argv = &self.config.worker_cmd;
        info!(command = ?argv, "spawning worker");
        let child = Command::new(&argv[0]).args(&argv[1..]).spawn()?;

        let pid = child.id().unwrap_or_default();
        process::write_pid_file(&self.config.pid_file, pid)?;
        self.child = Some(child);
        self.restarts.push_back(Instant::now());

        tokio::time::sleep(Duration::from_secs(self.config.startup_grace_sec)).await;
        if self.health_ok().await {
            info!(pid, "worker started");
            self.state = WorkerState::Running;
        }
        Ok(())
    }

    /// Health: the worker answers on its port. A spawned child that has
    /// exited is unhealthy regardless of who else holds the port.
    async fn health_ok(&mut self) -> bool {
        if let Some(child) = &mut self.child {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(code = status.code(), "worker process exited");
                self.child = None;
                return false;
            }
        }
        port_in_use(self.config.port).await
    }

    /// Restart budget check over the sliding window.
    fn can_restart(&mut self) -> bool {
        let window = Duration::from_secs(self.config.restart_window_sec);
        while let Some(front) = self.restarts.front() {
            if front.elapsed() > window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.len() < self.config.max_restarts
    }

    /// Terminate the worker and remove its PID file as one step.
    ///
    /// A kill failure propagates without touching the PID file, so the
    /// caller can retry; partial shutdown state is never recorded.
    pub async fn shutdown_worker(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => {}
                Err(e) => {
                    self.child = Some(child);
                    return Err(e.into());
                }
            }
        } else if let Some(pid) = process::validate_pid_file(&self.config.pid_file)? {
            // Adopted worker: terminate through the process table.
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                return Err(std::io::Error::other(err).into());
            }
        }

        process::remove_pid_file(&self.config.pid_file)?;
        self.state = WorkerState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(dir: &TempDir, port: u16, worker_cmd: Vec<String>) -> SupervisorConfig {
        SupervisorConfig {
            port,
            check_interval_sec: 0,
            startup_grace_sec: 0,
            failure_threshold: 1,
            max_restarts: 1,
            restart_window_sec: 3600,
            pid_file: dir.path().join(".worker.pid"),
            worker_cmd,
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_when_port_already_served() {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut supervisor = Supervisor::new(config(
            &dir,
            port,
            vec!["sleep".to_string(), "30".to_string()],
        ));
        let spawned = supervisor.ensure_started().await.unwrap();

        assert!(!spawned);
        assert_eq!(supervisor.state(), WorkerState::Running);
        // No child means no second worker was spawned.
        assert!(supervisor.child.is_none());
        drop(listener);
    }

    #[tokio::test]
    async fn spawn_writes_pid_file_and_shutdown_removes_it() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = Supervisor::new(config(
            &dir,
            free_port(),
            vec!["sleep".to_string(), "30".to_string()],
        ));

        let spawned = supervisor.ensure_started().await.unwrap();
        assert!(spawned);
        let pid_file: PathBuf = dir.path().join(".worker.pid");
        let pid = process::read_pid_file(&pid_file).unwrap();
        assert!(process::pid_alive(pid));

        supervisor.shutdown_worker().await.unwrap();
        assert!(!pid_file.exists());
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn crash_loop_escalates_to_terminal_failed() {
        let dir = TempDir::new().unwrap();
        // Worker exits immediately and nothing serves the port, so every
        // health check fails; with a budget of one spawn the loop must
        // park in FAILED instead of restarting forever.
        let mut supervisor = Supervisor::new(config(&dir, free_port(), vec!["true".to_string()]));

        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(SupervisorError::WorkerFailed { .. })));
        assert_eq!(supervisor.state(), WorkerState::Failed);
    }

    #[tokio::test]
    async fn cancellation_stops_worker_and_cleans_pid_file() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            free_port(),
            vec!["sleep".to_string(), "30".to_string()],
        );
        // Real check interval so the loop is parked in its sleep when the
        // cancel arrives, instead of racing through health checks.
        let cfg = SupervisorConfig {
            check_interval_sec: 1,
            ..cfg
        };
        let pid_file = cfg.pid_file.clone();

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut supervisor = Supervisor::new(cfg);
                supervisor.run(cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert!(result.is_ok());
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn restart_budget_window_slides() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, free_port(), vec!["true".to_string()]);
        cfg.max_restarts = 2;
        cfg.restart_window_sec = 0;
        let mut supervisor = Supervisor::new(cfg);

        supervisor.restarts.push_back(Instant::now());
        supervisor.restarts.push_back(Instant::now());
        // With a zero-length window both entries age out immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(supervisor.can_restart());
        assert!(supervisor.restarts.is_empty());
    }

    #[tokio::test]
    async fn empty_worker_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = Supervisor::new(config(&dir, free_port(), Vec::new()));
        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(SupervisorError::EmptyCommand)));
    }
}
