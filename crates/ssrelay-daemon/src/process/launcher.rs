//! External launcher collaborator.
//!
//! Relay processes are never forked here. An external script receives an
//! action name plus arguments and does the actual work; we only capture its
//! exit status and output under a wall-clock timeout.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use ssrelay_core::config::FleetConfig;

/// Actions the launcher script understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LauncherAction {
    StartSingleService,
    StopSingleService,
    RegenerateConfig,
    AddServiceApi,
}

impl LauncherAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartSingleService => "start_single_service",
            Self::StopSingleService => "stop_single_service",
            Self::RegenerateConfig => "regenerate_config",
            Self::AddServiceApi => "add_service_api",
        }
    }
}

impl fmt::Display for LauncherAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured result of one launcher invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LauncherOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl LauncherOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Errors from running the launcher.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("launcher script not found: {}", path.display())]
    Missing { path: PathBuf },

    #[error("launcher action {action} timed out after {}s", after.as_secs())]
    Timeout {
        action: LauncherAction,
        after: Duration,
    },

    #[error("failed to run launcher action {action}: {source}")]
    Spawn {
        action: LauncherAction,
        #[source]
        source: io::Error,
    },
}

/// Something that can run launcher actions.
///
/// Implementations may be written with `async fn`.
pub trait Launcher: Send + Sync {
    fn run(
        &self,
        action: LauncherAction,
        args: &[String],
    ) -> impl Future<Output = Result<LauncherOutput, LauncherError>> + Send;
}

/// Runs `<shell> <script> <action> <args...>` in the script's directory.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    shell: String,
    script: PathBuf,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ScriptLauncher {
    /// Fails with [`LauncherError::Missing`] if `script` is not a file.
    pub fn new(
        shell: impl Into<String>,
        script: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, LauncherError> {
        let script = script.into();
        if !script.is_file() {
            return Err(LauncherError::Missing { path: script });
        }
        let working_dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Ok(Self {
            shell: shell.into(),
            script,
            working_dir,
            timeout,
        })
    }

    pub fn from_config(config: &FleetConfig) -> Result<Self, LauncherError> {
        Self::new(
            config.launcher_shell.clone(),
            config.resolved_launcher_script(),
            config.launcher_timeout(),
        )
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

impl Launcher for ScriptLauncher {
    async fn run(
        &self,
        action: LauncherAction,
        args: &[String],
    ) -> Result<LauncherOutput, LauncherError> {
        let cmd_line = format!(
            "{} {} {action} {}",
            self.shell,
            self.script.display(),
            args.join(" ")
        );
        debug!(cwd = %self.working_dir.display(), "exec: {cmd_line}");

        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.script)
            .arg(action.as_str())
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                error!(%action, error = %source, "Failed to spawn launcher");
                return Err(LauncherError::Spawn { action, source });
            }
            Err(_) => {
                warn!(%action, timeout_secs = self.timeout.as_secs(), "Launcher timed out, killed");
                return Err(LauncherError::Timeout {
                    action,
                    after: self.timeout,
                });
            }
        };

        let result = LauncherOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if result.success() {
            info!(%action, "Launcher action succeeded");
        } else {
            error!(
                %action,
                status = ?result.status,
                stderr = result.stderr.trim(),
                "Launcher action failed"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("launcher.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_script_is_rejected_up_front() {
        let err = ScriptLauncher::new("sh", "/nonexistent/launcher.sh", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, LauncherError::Missing { .. }));
    }

    #[tokio::test]
    async fn captures_output_and_args() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo \"$1 $2\"; pwd >&2; exit 0\n");
        let launcher = ScriptLauncher::new("sh", &path, Duration::from_secs(5)).unwrap();

        let out = launcher
            .run(LauncherAction::StartSingleService, &["12345".to_string()])
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "start_single_service 12345");
        let cwd = PathBuf::from(out.stderr.trim()).canonicalize().unwrap();
        assert_eq!(cwd, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo boom >&2; exit 3\n");
        let launcher = ScriptLauncher::new("sh", &path, Duration::from_secs(5)).unwrap();

        let out = launcher
            .run(LauncherAction::RegenerateConfig, &[])
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sleep 5\n");
        let launcher = ScriptLauncher::new("sh", &path, Duration::from_millis(200)).unwrap();

        let started = std::time::Instant::now();
        let err = launcher
            .run(LauncherAction::StopSingleService, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
