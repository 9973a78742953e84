//! Fleet operations: the flows an operator runs against the relay catalog.
//!
//! [`Fleet`] ties the registry, process controller, port allocator and
//! prober together. Every flow re-reads the filesystem; nothing is cached.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use ssrelay_core::model::{self, parse_backend, unix_timestamp};
use ssrelay_core::{
    AllocError, Config, Endpoint, ExpiryPolicy, LifecycleState, PortAllocator, RelayCredential,
    RelayLink, RelayRecord, link,
};

use crate::probe::{self, ProbeFailureKind, ProbeResult};
use crate::process::{
    ControllerError, Launcher, LauncherAction, LauncherOutput, ProcessController, StartOutcome,
    StopOutcome,
};
use crate::registry::backup::{BackupInfo, RestoredBackup};
use crate::registry::files::default_label;
use crate::registry::{Registry, RegistryError};

/// Longest accepted relay label, in characters.
pub const MAX_LABEL_LEN: usize = 100;

/// Host advertised when nothing better is known.
const FALLBACK_HOST: &str = "127.0.0.1";

/// Errors from fleet flows.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Invalid(#[from] ssrelay_core::Error),

    #[error("relay on port {port} has expired")]
    Expired { port: u16 },

    #[error("launcher failed: {0}")]
    Launcher(String),
}

impl FleetError {
    /// Short machine-classifiable reason.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Registry(e) => e.code(),
            Self::Controller(e) => e.code(),
            Self::Alloc(e) => e.code(),
            Self::Invalid(e) => e.code(),
            Self::Expired { .. } => "expired",
            Self::Launcher(_) => "launcher_failed",
        }
    }
}

/// Request to create a relay.
#[derive(Debug, Clone)]
pub struct NewRelay {
    pub label: String,
    /// `ip:port` or `ip:port:user:pass`.
    pub backend: String,
    pub expiry: ExpiryPolicy,
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddedRelay {
    pub record: RelayRecord,
    pub link: String,
    /// Set when autostart was requested and failed. The relay still exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_error: Option<String>,
}

/// Fields to change on an existing relay; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct RelayUpdate {
    pub label: Option<String>,
    pub backend: Option<String>,
    pub expiry: Option<ExpiryPolicy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdatedRelay {
    pub record: RelayRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regenerate_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeletedRelay {
    pub port: u16,
    pub stop: StopOutcome,
    /// The launcher's own stop is best effort.
    pub launcher_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortProbe {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub result: ProbeResult,
}

/// Per-port probe results plus a summary.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub results: Vec<PortProbe>,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Result of diagnosing one relay.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub port: u16,
    pub checks: Vec<Check>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Diagnosis {
    pub fn healthy(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.ok)
    }

    fn pass(&mut self, name: &'static str, detail: impl Into<String>) {
        self.checks.push(Check {
            name,
            ok: true,
            detail: detail.into(),
        });
    }

    fn fail(&mut self, name: &'static str, detail: impl Into<String>) {
        self.checks.push(Check {
            name,
            ok: false,
            detail: detail.into(),
        });
    }
}

/// Relay fleet on one host.
pub struct Fleet<L> {
    registry: Arc<Registry>,
    controller: ProcessController<L>,
    allocator: PortAllocator,
    public_host: String,
    probe_timeout: Duration,
    probe_workers: usize,
    retention: Duration,
}

impl<L: Launcher> Fleet<L> {
    pub fn new(registry: Arc<Registry>, launcher: L, config: &Config) -> Result<Self, FleetError> {
        let public_host = resolve_public_host(config.fleet.public_host.as_deref());
        Endpoint::new(public_host.as_str(), 1).validate()?;
        Ok(Self {
            controller: ProcessController::new(launcher, Arc::clone(&registry), &config.process),
            registry,
            allocator: config.ports.allocator()?,
            public_host,
            probe_timeout: Duration::from_secs(config.probe.timeout_secs),
            probe_workers: config.probe.workers,
            retention: config.recycle.retention(),
        })
    }

    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub const fn controller(&self) -> &ProcessController<L> {
        &self.controller
    }

    pub fn public_host(&self) -> &str {
        &self.public_host
    }

    pub fn list(&self) -> Result<Vec<RelayRecord>, FleetError> {
        Ok(self.registry.list()?)
    }

    pub fn list_deleted(&self) -> Result<Vec<RelayRecord>, FleetError> {
        Ok(self.registry.list_deleted()?)
    }

    pub fn get(&self, port: u16) -> Result<RelayRecord, FleetError> {
        Ok(self.registry.get(port)?)
    }

    /// Client link for an active relay.
    pub fn link(&self, port: u16) -> Result<RelayLink, FleetError> {
        Ok(self.registry.get(port)?.link(&self.public_host))
    }

    /// Create a relay on a freshly allocated port. A failed autostart is
    /// reported in the result and does not undo the creation.
    pub async fn add(&self, request: NewRelay) -> Result<AddedRelay, FleetError> {
        let label = validate_label(&request.label)?;
        let (backend, backend_auth) = parse_backend(&request.backend)?;

        let existing = self.registry.ports_in_use()?;
        let port = self
            .allocator
            .allocate_with(&existing, |p| self.registry.is_reserved(p) || port_is_bound(p))?;

        let now = unix_timestamp();
        let record = RelayRecord {
            port,
            label,
            backend,
            backend_auth,
            credential: RelayCredential::generate(),
            created_at: now,
            expires_at: request.expiry.expires_at(now),
            lifecycle_state: LifecycleState::Stopped,
            soft_deleted_at: None,
        };
        self.registry.create(&record)?;

        let start_error = if request.autostart {
            match self.controller.start(port).await {
                Ok(_) => None,
                Err(e) => {
                    warn!(port, error = %e, "Autostart of new relay failed");
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        let record = self.registry.get(port)?;
        Ok(AddedRelay {
            link: record.link(&self.public_host).encode(),
            record,
            start_error,
        })
    }

    /// Let the launcher create relays itself. Returns the relays that appeared.
    pub async fn add_via_launcher(
        &self,
        label: &str,
        backend: &str,
        expiry: ExpiryPolicy,
    ) -> Result<Vec<RelayRecord>, FleetError> {
        let label = validate_label(label)?;
        let (endpoint, auth) = parse_backend(backend)?;
        let (user, pass) = auth.map_or_else(Default::default, |a| (a.user, a.pass));
        let target = format!("{}:{}:{user}:{pass}", endpoint.host, endpoint.port);

        let before = self.registry.ports_in_use()?;
        let output = self
            .controller
            .launcher()
            .run(
                LauncherAction::AddServiceApi,
                &[label, target, expiry.to_string()],
            )
            .await
            .map_err(|e| FleetError::Launcher(e.to_string()))?;
        if !output.success() {
            return Err(FleetError::Launcher(failure_text(&output)));
        }

        let after = self.registry.ports_in_use()?;
        let added: BTreeSet<u16> = after.difference(&before).copied().collect();
        info!(ports = ?added, "Launcher created relays");
        Ok(added
            .into_iter()
            .filter_map(|port| match self.registry.get(port) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(port, error = %e, "Launcher-created relay is unreadable");
                    None
                }
            })
            .collect())
    }

    /// Change label, backend or expiry, then ask the launcher to regenerate
    /// the relay configuration (best effort).
    pub async fn update(&self, port: u16, changes: RelayUpdate) -> Result<UpdatedRelay, FleetError> {
        let mut record = self.registry.get(port)?;
        let now = unix_timestamp();
        if let Some(label) = changes.label {
            record.label = validate_label(&label)?;
        }
        if let Some(backend) = changes.backend {
            let (endpoint, auth) = parse_backend(&backend)?;
            record.backend = endpoint;
            record.backend_auth = auth;
        }
        if let Some(expiry) = changes.expiry {
            record.expires_at = expiry.expires_at(now);
        }
        self.registry.update(&record, now)?;

        let regenerate_error = match self
            .controller
            .launcher_action(port, LauncherAction::RegenerateConfig)
            .await
        {
            Ok(output) if output.success() => None,
            Ok(output) => Some(failure_text(&output)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(e) = &regenerate_error {
            warn!(port, error = %e, "Config regeneration failed after update");
        }

        Ok(UpdatedRelay {
            record: self.registry.get(port)?,
            regenerate_error,
        })
    }

    /// Start a relay. Expired relays are refused.
    pub async fn start(&self, port: u16) -> Result<StartOutcome, FleetError> {
        self.ensure_not_expired(port)?;
        Ok(self.controller.start(port).await?)
    }

    pub async fn stop(&self, port: u16) -> Result<StopOutcome, FleetError> {
        if !self.registry.exists(port) {
            return Err(RegistryError::NotFound { port }.into());
        }
        Ok(self.controller.stop(port).await?)
    }

    /// Restart a relay. Expired relays are refused before anything is stopped.
    pub async fn restart(&self, port: u16) -> Result<StartOutcome, FleetError> {
        self.ensure_not_expired(port)?;
        Ok(self.controller.restart(port).await?)
    }

    fn ensure_not_expired(&self, port: u16) -> Result<(), FleetError> {
        if self.registry.get(port)?.is_expired(unix_timestamp()) {
            return Err(FleetError::Expired { port });
        }
        Ok(())
    }

    /// Current state of any port, including soft-deleted and unknown ones.
    pub fn status(&self, port: u16) -> LifecycleState {
        if self.registry.exists(port) {
            let expires_at = self.registry.get(port).ok().and_then(|r| r.expires_at);
            self.controller
                .query_state(port, expires_at, unix_timestamp())
        } else if self.registry.is_reserved(port) {
            LifecycleState::SoftDeleted
        } else {
            LifecycleState::Missing
        }
    }

    /// Stop a relay and move it to the recycle bin.
    pub async fn delete(&self, port: u16) -> Result<DeletedRelay, FleetError> {
        if !self.registry.exists(port) {
            return Err(RegistryError::NotFound { port }.into());
        }

        let launcher_error = match self
            .controller
            .launcher_action(port, LauncherAction::StopSingleService)
            .await
        {
            Ok(output) if output.success() => None,
            Ok(output) => Some(failure_text(&output)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(e) = &launcher_error {
            warn!(port, error = %e, "Launcher stop failed, stopping by PID");
        }

        let stop = self.controller.stop(port).await?;
        self.registry.soft_delete(port, unix_timestamp())?;
        Ok(DeletedRelay {
            port,
            stop,
            launcher_error,
        })
    }

    pub fn restore(&self, port: u16) -> Result<RelayRecord, FleetError> {
        Ok(self.registry.restore(port)?)
    }

    pub fn purge(&self, port: u16) -> Result<(), FleetError> {
        Ok(self.registry.purge(port)?)
    }

    /// Purge recycle bin entries past the retention window.
    pub fn sweep(&self) -> Result<Vec<u16>, FleetError> {
        Ok(self.registry.sweep(self.retention, unix_timestamp())?)
    }

    pub fn logs(&self, port: u16, lines: usize) -> Result<Vec<String>, FleetError> {
        Ok(self.registry.tail_log(port, lines)?)
    }

    pub fn clear_logs(&self, port: u16) -> Result<(), FleetError> {
        Ok(self.registry.clear_log(port)?)
    }

    /// Archive every active relay.
    pub fn backup(&self) -> Result<BackupInfo, FleetError> {
        Ok(self.registry.create_backup(unix_timestamp())?)
    }

    pub fn backups(&self) -> Result<Vec<BackupInfo>, FleetError> {
        Ok(self.registry.list_backups()?)
    }

    /// Restore relay files from a backup. Running relays keep their old
    /// configuration until restarted.
    pub fn restore_backup(&self, name: &str) -> Result<RestoredBackup, FleetError> {
        Ok(self.registry.restore_backup(name, unix_timestamp())?)
    }

    /// Probe relays by port at the advertised host. Unknown ports are
    /// reported as failures. Results follow the order of `ports`.
    pub async fn test_ports(&self, ports: &[u16]) -> TestReport {
        let mut seen = BTreeSet::new();
        let ports: Vec<u16> = ports.iter().copied().filter(|p| seen.insert(*p)).collect();

        let mut labels = HashMap::new();
        let mut endpoints = Vec::new();
        for &port in &ports {
            if let Ok(record) = self.registry.get(port) {
                labels.insert(port, record.label);
                endpoints.push(Endpoint::new(self.public_host.as_str(), port));
            }
        }

        let mut probed: HashMap<u16, ProbeResult> =
            probe::probe_batch(endpoints, self.probe_timeout, self.probe_workers)
                .await
                .into_iter()
                .map(|r| (r.endpoint.port, r))
                .collect();

        let results: Vec<PortProbe> = ports
            .into_iter()
            .map(|port| PortProbe {
                port,
                label: labels.remove(&port),
                result: probed.remove(&port).unwrap_or_else(|| {
                    ProbeResult::failed(
                        Endpoint::new(self.public_host.as_str(), port),
                        ProbeFailureKind::Other,
                        "relay not found".to_string(),
                    )
                }),
            })
            .collect();

        let success = results.iter().filter(|r| r.result.reachable).count();
        TestReport {
            total: results.len(),
            success,
            failed: results.len() - success,
            results,
        }
    }

    /// Probe every active relay.
    pub async fn test_all(&self) -> Result<TestReport, FleetError> {
        let ports: Vec<u16> = self.registry.list()?.iter().map(|r| r.port).collect();
        Ok(self.test_ports(&ports).await)
    }

    /// Walk through the checks an operator would do by hand: configuration
    /// readable, inbound port and password present, link round-trips, relay
    /// reachable.
    pub async fn diagnose(&self, port: u16) -> Result<Diagnosis, FleetError> {
        if !self.registry.exists(port) {
            return Err(RegistryError::NotFound { port }.into());
        }
        let mut diagnosis = Diagnosis {
            port,
            checks: Vec::new(),
            link: None,
        };

        let config = match self.registry.relay_config(port) {
            Ok(config) => {
                diagnosis.pass("config", "config.json is readable");
                config
            }
            Err(e) => {
                diagnosis.fail("config", e.to_string());
                return Ok(diagnosis);
            }
        };

        let inbound = &config["inbounds"][0];
        match inbound["port"].as_u64() {
            Some(p) if p == u64::from(port) => diagnosis.pass("inbound_port", format!("{p}")),
            Some(p) => diagnosis.fail(
                "inbound_port",
                format!("config listens on {p}, expected {port}"),
            ),
            None => diagnosis.fail("inbound_port", "no inbound port configured"),
        }

        let settings = &inbound["settings"];
        let Some(password) = settings["password"].as_str().filter(|p| !p.is_empty()) else {
            diagnosis.fail("password", "no inbound password configured");
            return Ok(diagnosis);
        };
        diagnosis.pass("password", "present");

        let label = self
            .registry
            .get(port)
            .map_or_else(|_| default_label(port), |r| r.label);
        let expected = RelayLink::new(
            RelayCredential::new(method_of(settings), password),
            Endpoint::new(self.public_host.as_str(), port),
            label,
        );
        let encoded = expected.encode();
        match link::decode(&encoded) {
            Ok(decoded) if decoded == expected => diagnosis.pass("link", "encodes and decodes back"),
            Ok(_) => diagnosis.fail("link", "decoded link differs from the relay settings"),
            Err(e) => diagnosis.fail("link", e.to_string()),
        }
        diagnosis.link = Some(encoded);

        let result = probe::probe(&expected.endpoint, self.probe_timeout).await;
        match (result.reachable, result.latency_ms, result.failure_reason) {
            (true, Some(ms), _) => diagnosis.pass("reachable", format!("{ms} ms")),
            (_, _, reason) => diagnosis.fail(
                "reachable",
                reason.unwrap_or_else(|| "unreachable".to_string()),
            ),
        }
        Ok(diagnosis)
    }
}

fn method_of(settings: &Value) -> &str {
    settings["method"]
        .as_str()
        .unwrap_or(model::DEFAULT_CIPHER)
}

fn failure_text(output: &LauncherOutput) -> String {
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    format!("exit {:?}: {detail}", output.status)
}

/// Trimmed label of 1 to [`MAX_LABEL_LEN`] characters.
pub fn validate_label(label: &str) -> Result<String, ssrelay_core::Error> {
    let label = label.trim();
    if label.is_empty() {
        return Err(ssrelay_core::Error::InvalidInput(
            "label must not be empty".into(),
        ));
    }
    if label.chars().count() > MAX_LABEL_LEN {
        return Err(ssrelay_core::Error::InvalidInput(format!(
            "label must be at most {MAX_LABEL_LEN} characters"
        )));
    }
    Ok(label.to_string())
}

/// True if something on this host already listens on `port`.
fn port_is_bound(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_err()
}

/// Host to advertise in links: the configured one, else the address of the
/// primary outbound interface, else loopback.
pub fn resolve_public_host(configured: Option<&str>) -> String {
    if let Some(host) = configured.map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }
    outbound_ip().map_or_else(
        || {
            warn!("Could not detect a public address, advertising {FALLBACK_HOST}");
            FALLBACK_HOST.to_string()
        },
        |ip| ip.to_string(),
    )
}

/// Local address the kernel would use to reach the internet. Connecting a
/// UDP socket sends no packets.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn label_bounds() {
        assert_eq!(validate_label("  node 1 ").unwrap(), "node 1");
        assert!(validate_label("   ").is_err());
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN)).is_ok());
        assert!(validate_label(&"节".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn configured_public_host_wins() {
        assert_eq!(resolve_public_host(Some(" relay.example.com ")), "relay.example.com");
        let detected = resolve_public_host(None);
        assert!(!detected.is_empty());
    }

    #[test]
    fn failure_text_prefers_stderr() {
        let output = LauncherOutput {
            status: Some(2),
            stdout: "out".into(),
            stderr: " err \n".into(),
        };
        assert_eq!(failure_text(&output), "exit Some(2): err");
        let output = LauncherOutput {
            status: None,
            stdout: "out".into(),
            stderr: String::new(),
        };
        assert_eq!(failure_text(&output), "exit None: out");
    }
}
