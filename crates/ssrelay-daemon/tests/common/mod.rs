//! Shared fixtures for daemon integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;

use ssrelay_daemon::process::{Launcher, LauncherAction, LauncherError, LauncherOutput};

/// Port the double uses for relays it creates via `add_service_api`.
pub const SCRIPTED_PORT: u16 = 42424;

/// Launcher double that plays the external script's part with real processes.
///
/// `start_single_service <port>` spawns `sleep 30` and records its PID in the
/// relay directory, reaping it in the background so signals are observed
/// promptly. Other actions succeed unless listed in `failing`.
pub struct SpawningLauncher {
    pub services_dir: PathBuf,
    pub failing: Vec<LauncherAction>,
    pub calls: Mutex<Vec<(LauncherAction, Vec<String>)>>,
}

impl SpawningLauncher {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            services_dir: data_dir.join("services"),
            failing: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, action: LauncherAction) -> Self {
        self.failing.push(action);
        self
    }

    pub fn calls(&self, action: LauncherAction) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| *a == action)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl Launcher for SpawningLauncher {
    async fn run(
        &self,
        action: LauncherAction,
        args: &[String],
    ) -> Result<LauncherOutput, LauncherError> {
        self.calls.lock().unwrap().push((action, args.to_vec()));
        if self.failing.contains(&action) {
            return Ok(LauncherOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("{action} refused"),
            });
        }

        if action == LauncherAction::StartSingleService {
            let mut child = tokio::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .map_err(|source| LauncherError::Spawn { action, source })?;
            let pid = child.id().unwrap();
            std::fs::write(self.services_dir.join(&args[0]).join("xray.pid"), pid.to_string())
                .unwrap();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }

        if action == LauncherAction::AddServiceApi {
            let parts: Vec<&str> = args[1].split(':').collect();
            let dir = self.services_dir.join(SCRIPTED_PORT.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("config.env"),
                format!(
                    "PORT={SCRIPTED_PORT}\nPASSWORD=scripted\nNODE_NAME={}\nSOCKS_IP={}\nSOCKS_PORT={}\n",
                    args[0], parts[0], parts[1]
                ),
            )
            .unwrap();
        }

        Ok(LauncherOutput {
            status: Some(0),
            stdout: "ok".to_string(),
            stderr: String::new(),
        })
    }
}
