//! Configuration and fleet setup shared by the subcommands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use ssrelay_core::Config;
use ssrelay_daemon::process::ScriptLauncher;
use ssrelay_daemon::{Fleet, Registry};

/// Flags that override the configuration files.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (JSON), merged over the global settings file
    #[arg(long, global = true, env = "SSRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding services/ and recycle/
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Host advertised in client links
    #[arg(long, global = true)]
    pub public_host: Option<String>,

    /// Launcher script that starts and stops relays
    #[arg(long, global = true)]
    pub launcher: Option<PathBuf>,
}

impl GlobalArgs {
    /// Layered configuration with command-line flags applied last.
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = ssrelay_core::config::load_config(self.config.as_deref())
            .context("loading configuration")?;
        if let Some(dir) = &self.data_dir {
            config.fleet.data_dir = Some(dir.clone());
        }
        if let Some(host) = &self.public_host {
            config.fleet.public_host = Some(host.clone());
        }
        if let Some(script) = &self.launcher {
            config.fleet.launcher_script = Some(script.clone());
        }
        Ok(config)
    }
}

/// Open the registry and wire it to the configured launcher script. A
/// missing script fails here, before any command runs.
pub fn open_fleet(config: &Config) -> anyhow::Result<Fleet<ScriptLauncher>> {
    let launcher = ScriptLauncher::from_config(&config.fleet)
        .context("launcher unavailable (set --launcher or fleet.launcher_script)")?;
    let data_dir = config.fleet.resolved_data_dir();
    let registry = Registry::open(&data_dir)
        .with_context(|| format!("opening registry at {}", data_dir.display()))?;
    debug!(
        data_dir = %data_dir.display(),
        launcher = %launcher.script().display(),
        "Fleet opened"
    );
    Fleet::new(Arc::new(registry), launcher, config).context("initialising fleet")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ssrelay.json");
        std::fs::write(
            &file,
            r#"{"fleet": {"public_host": "file.example.com"}, "probe": {"workers": 9}}"#,
        )
        .unwrap();

        let args = GlobalArgs {
            config: Some(file),
            data_dir: Some(dir.path().join("data")),
            public_host: Some("flag.example.com".into()),
            launcher: None,
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.fleet.public_host.as_deref(), Some("flag.example.com"));
        assert_eq!(config.fleet.data_dir, Some(dir.path().join("data")));
        assert_eq!(config.probe.workers, 9);
        assert_eq!(
            config.fleet.resolved_launcher_script(),
            dir.path().join("data").join("launcher.sh")
        );
    }

    #[test]
    fn missing_launcher_fails_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let args = GlobalArgs {
            data_dir: Some(dir.path().join("data")),
            public_host: Some("127.0.0.1".into()),
            ..GlobalArgs::default()
        };
        let err = open_fleet(&args.load_config().unwrap()).err().unwrap();
        assert!(format!("{err:#}").contains("launcher script not found"));
        assert!(!dir.path().join("data").exists());
    }

    #[test]
    fn fleet_opens_with_a_launcher_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("launcher.sh");
        std::fs::write(&script, "exit 0\n").unwrap();
        let args = GlobalArgs {
            data_dir: Some(dir.path().to_path_buf()),
            public_host: Some("127.0.0.1".into()),
            launcher: Some(script),
            ..GlobalArgs::default()
        };
        let fleet = open_fleet(&args.load_config().unwrap()).unwrap();
        assert!(fleet.list().unwrap().is_empty());
        assert!(dir.path().join("services").is_dir());
    }
}
