//! Configuration resolution for ssrelay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/ssrelay/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`SSRELAY_*`)
//! 5. CLI arguments (applied by the binaries, highest priority)
//!
//! Files may be partial: they are merged key by key onto the layers below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ports::{self, AllocError, PortAllocator};

/// Complete ssrelay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub recycle: RecycleConfig,
}

/// Where relays live and how they are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Root holding `services/` and `recycle/`.
    pub data_dir: Option<PathBuf>,
    /// Host advertised in generated links. Detected when unset.
    pub public_host: Option<String>,
    /// External launcher script.
    pub launcher_script: Option<PathBuf>,
    /// Interpreter the launcher script is run with.
    pub launcher_shell: String,
    pub launcher_timeout_secs: u64,
    /// Log level used when no `--log-level` flag is given.
    pub log_level: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            public_host: None,
            launcher_script: None,
            launcher_shell: "bash".to_string(),
            launcher_timeout_secs: 60,
            log_level: None,
        }
    }
}

impl FleetConfig {
    /// Configured data directory, or the platform default.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Configured launcher script, or `launcher.sh` inside the data directory.
    pub fn resolved_launcher_script(&self) -> PathBuf {
        self.launcher_script
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("launcher.sh"))
    }

    pub const fn launcher_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher_timeout_secs)
    }
}

/// Port pool for new relays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub min_port: u16,
    pub max_port: u16,
    pub attempts: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            min_port: ports::DEFAULT_MIN_PORT,
            max_port: ports::DEFAULT_MAX_PORT,
            attempts: ports::DEFAULT_ATTEMPTS,
        }
    }
}

impl PortConfig {
    pub fn allocator(&self) -> std::result::Result<PortAllocator, AllocError> {
        PortAllocator::new(self.min_port, self.max_port, self.attempts)
    }
}

/// Signal and restart timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace_ms: u64,
    /// Pause between stop and start on restart.
    pub restart_delay_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_ms: 1_000,
            restart_delay_ms: 2_000,
        }
    }
}

/// Connectivity probe defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
    pub workers: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            workers: 5,
        }
    }
}

/// Soft-delete retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecycleConfig {
    pub retention_days: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl RecycleConfig {
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/ssrelay/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("ssrelay").join("settings.json"))
    }
}

/// Default data directory: `<platform data dir>/ssrelay`, or `./data` when
/// no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from("data"), |d| d.join("ssrelay"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("SSRELAY_DATA_DIR") {
        config.fleet.data_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("SSRELAY_PUBLIC_HOST") {
        config.fleet.public_host = Some(val);
    }
    if let Some(val) = var("SSRELAY_LAUNCHER") {
        config.fleet.launcher_script = Some(PathBuf::from(val));
    }
    if let Some(n) = var("SSRELAY_LAUNCHER_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.fleet.launcher_timeout_secs = n;
    }
    if let Some(val) = var("SSRELAY_LOG_LEVEL") {
        config.fleet.log_level = Some(val);
    }
    if let Some(n) = var("SSRELAY_PROBE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.probe.timeout_secs = n;
    }
    if let Some(n) = var("SSRELAY_PROBE_WORKERS").and_then(|v| v.parse().ok()) {
        config.probe.workers = n;
    }
    if let Some(n) = var("SSRELAY_RETENTION_DAYS").and_then(|v| v.parse().ok()) {
        config.recycle.retention_days = n;
    }
}
