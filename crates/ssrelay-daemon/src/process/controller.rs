//! Relay process lifecycle.
//!
//! Starting goes through the launcher; stopping is done here by signalling
//! the PID recorded in the relay directory (SIGTERM, grace period, SIGKILL).
//! All lifecycle operations on one port hold that port's async mutex.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ssrelay_core::LifecycleState;
use ssrelay_core::config::ProcessConfig;

use super::launcher::{Launcher, LauncherAction, LauncherError, LauncherOutput};
use super::pidfile::{self, PidFile};
use crate::registry::Registry;

/// Interval between liveness checks while waiting for SIGTERM to land.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("launcher timed out after {}s for port {port}", after.as_secs())]
    LauncherTimeout { port: u16, after: Duration },

    #[error("launcher failed for port {port} (exit {status:?}): {}", stderr.trim())]
    LauncherFailed {
        port: u16,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    LauncherMissing(LauncherError),

    #[error("relay on port {port} has no configuration directory")]
    ConfigMissing { port: u16 },

    #[error("failed to stop relay on port {port}: {reason}")]
    StopFailed { port: u16, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ControllerError {
    /// Short machine-classifiable reason.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LauncherTimeout { .. } => "launcher_timeout",
            Self::LauncherFailed { .. } => "launcher_failed",
            Self::LauncherMissing(_) => "launcher_missing",
            Self::ConfigMissing { .. } => "config_missing",
            Self::StopFailed { .. } => "stop_failed",
            Self::Io(_) => "io",
        }
    }

    fn from_launcher(port: u16, err: LauncherError) -> Self {
        match err {
            LauncherError::Timeout { after, .. } => Self::LauncherTimeout { port, after },
            LauncherError::Spawn { source, .. } => Self::Io(source),
            missing @ LauncherError::Missing { .. } => Self::LauncherMissing(missing),
        }
    }
}

/// How a successful stop went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live process was recorded.
    NotRunning,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// How a successful start went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Starts, stops and inspects relay processes.
pub struct ProcessController<L> {
    launcher: L,
    registry: Arc<Registry>,
    grace: Duration,
    restart_delay: Duration,
    locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
}

impl<L: Launcher> ProcessController<L> {
    pub fn new(launcher: L, registry: Arc<Registry>, config: &ProcessConfig) -> Self {
        Self {
            launcher,
            registry,
            grace: Duration::from_millis(config.grace_ms),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    async fn port_lock(&self, port: u16) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().await.entry(port).or_default())
    }

    /// Drop the lock of `port` from the map once no other caller holds it.
    async fn release_lock(&self, port: u16, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(&port).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&port);
        }
    }

    /// Ask the launcher to start the relay on `port`.
    pub async fn start(&self, port: u16) -> Result<StartOutcome, ControllerError> {
        let lock = self.port_lock(port).await;
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(port).await
        };
        self.release_lock(port, lock).await;
        result
    }

    /// Stop the relay on `port`. Stopping a stopped relay succeeds.
    pub async fn stop(&self, port: u16) -> Result<StopOutcome, ControllerError> {
        let lock = self.port_lock(port).await;
        let result = {
            let _guard = lock.lock().await;
            self.stop_locked(port).await
        };
        self.release_lock(port, lock).await;
        result
    }

    /// Stop, wait the restart delay, start. A failed stop aborts the restart.
    pub async fn restart(&self, port: u16) -> Result<StartOutcome, ControllerError> {
        let lock = self.port_lock(port).await;
        let result = {
            let _guard = lock.lock().await;
            match self.stop_locked(port).await {
                Ok(_) => {
                    tokio::time::sleep(self.restart_delay).await;
                    self.start_locked(port).await
                }
                Err(e) => Err(e),
            }
        };
        self.release_lock(port, lock).await;
        result
    }

    /// Current state of `port`, with expiry overriding liveness.
    pub fn query_state(&self, port: u16, expires_at: Option<u64>, now: u64) -> LifecycleState {
        if !self.registry.exists(port) {
            return LifecycleState::Missing;
        }
        pidfile::liveness(&self.registry.pid_path(port)).with_expiry(expires_at, now)
    }

    /// Run an arbitrary launcher action on behalf of `port`, under its lock.
    pub async fn launcher_action(
        &self,
        port: u16,
        action: LauncherAction,
    ) -> Result<LauncherOutput, ControllerError> {
        let lock = self.port_lock(port).await;
        let result = {
            let _guard = lock.lock().await;
            self.launcher
                .run(action, &[port.to_string()])
                .await
                .map_err(|e| ControllerError::from_launcher(port, e))
        };
        self.release_lock(port, lock).await;
        result
    }

    async fn start_locked(&self, port: u16) -> Result<StartOutcome, ControllerError> {
        if !self.registry.exists(port) {
            return Err(ControllerError::ConfigMissing { port });
        }
        let pid_path = self.registry.pid_path(port);
        if pidfile::liveness(&pid_path) == LifecycleState::Running {
            debug!(port, "Relay already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        info!(port, "Starting relay");
        let result = self
            .launcher
            .run(LauncherAction::StartSingleService, &[port.to_string()])
            .await;

        let err = match result {
            Ok(output) if output.success() => {
                info!(port, "Relay started");
                return Ok(StartOutcome::Started);
            }
            Ok(output) => ControllerError::LauncherFailed {
                port,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Err(e) => ControllerError::from_launcher(port, e),
        };

        if let Err(e) = pidfile::remove(&pid_path) {
            warn!(port, error = %e, "Failed to remove PID file after failed start");
        }
        Err(err)
    }

    async fn stop_locked(&self, port: u16) -> Result<StopOutcome, ControllerError> {
        let pid_path = self.registry.pid_path(port);
        let pid = match pidfile::read(&pid_path)? {
            PidFile::Absent => return Ok(StopOutcome::NotRunning),
            PidFile::Garbage => {
                warn!(port, "PID file is not a process id, treating relay as stopped");
                pidfile::remove(&pid_path)?;
                return Ok(StopOutcome::NotRunning);
            }
            PidFile::Pid(pid) => pid,
        };

        info!(port, pid = pid.as_raw(), "Stopping relay");
        let outcome = if signal(port, pid, Signal::SIGTERM)? {
            if self.wait_for_exit(pid).await {
                StopOutcome::Terminated
            } else {
                warn!(port, pid = pid.as_raw(), "Relay ignored SIGTERM, sending SIGKILL");
                signal(port, pid, Signal::SIGKILL)?;
                StopOutcome::Killed
            }
        } else {
            StopOutcome::NotRunning
        };

        pidfile::remove(&pid_path)?;
        info!(port, ?outcome, "Relay stopped");
        Ok(outcome)
    }

    /// Poll liveness until `pid` is gone or the grace period elapses.
    async fn wait_for_exit(&self, pid: Pid) -> bool {
        let deadline = Instant::now() + self.grace;
        loop {
            if !pidfile::is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Send `sig`. Returns false if the process no longer exists.
fn signal(port: u16, pid: Pid, sig: Signal) -> Result<bool, ControllerError> {
    match kill(pid, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => {
            debug!(port, pid = pid.as_raw(), "Process already gone");
            Ok(false)
        }
        Err(e) => Err(ControllerError::StopFailed {
            port,
            reason: format!("{sig} to pid {pid}: {e}"),
        }),
    }
}
