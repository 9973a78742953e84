//! Relay subcommands: everything that manages relays on this host.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::Write;

use dialoguer::Confirm;

use ssrelay_core::model::unix_timestamp;
use ssrelay_core::{ExpiryPolicy, LifecycleState, RelayRecord};
use ssrelay_daemon::Fleet;
use ssrelay_daemon::fleet::{Diagnosis, NewRelay, RelayUpdate, TestReport};
use ssrelay_daemon::process::{Launcher, StartOutcome, StopOutcome};

/// Exit status for `test` with nothing reachable and for an unhealthy `diagnose`.
pub const EXIT_UNHEALTHY: u8 = 2;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Relay subcommand actions.
#[derive(clap::Subcommand, Debug)]
pub enum RelayAction {
    /// List relays.
    List {
        /// List the recycle bin instead.
        #[arg(long)]
        deleted: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show one relay and its client link.
    Show {
        port: u16,
        #[arg(long)]
        json: bool,
    },
    /// Create a relay on a free port.
    Add {
        /// Display name, 1-100 characters.
        #[arg(long)]
        label: String,
        /// SOCKS5 backend as ip:port or ip:port:user:pass.
        #[arg(long)]
        backend: String,
        /// permanent, 7days, 30days, 90days or custom:<days>.
        #[arg(long, default_value = "permanent")]
        expiry: ExpiryPolicy,
        /// Start the relay once created.
        #[arg(long)]
        start: bool,
        /// Let the launcher script create the relay itself.
        #[arg(long, conflicts_with = "start")]
        via_launcher: bool,
        #[arg(long)]
        json: bool,
    },
    /// Change label, backend or expiry of a relay.
    Update {
        port: u16,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        backend: Option<String>,
        #[arg(long)]
        expiry: Option<ExpiryPolicy>,
    },
    /// Start a relay.
    Start { port: u16 },
    /// Stop a relay.
    Stop { port: u16 },
    /// Stop and start a relay.
    Restart { port: u16 },
    /// Lifecycle state of relays (all active relays if no port is given).
    Status { ports: Vec<u16> },
    /// Stop a relay and move it to the recycle bin.
    Delete { port: u16 },
    /// Bring a relay back from the recycle bin.
    Restore { port: u16 },
    /// Permanently remove a relay from the recycle bin.
    Purge {
        port: u16,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
    /// Purge recycle bin entries past the retention period.
    Sweep,
    /// Show or clear a relay's log.
    Logs {
        port: u16,
        /// Number of trailing lines.
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
        /// Truncate the log instead of printing it.
        #[arg(long)]
        clear: bool,
    },
    /// Probe relays by port (all active relays if no port is given).
    Test {
        ports: Vec<u16>,
        #[arg(long)]
        json: bool,
    },
    /// Check a relay's configuration, link and reachability.
    Diagnose {
        port: u16,
        #[arg(long)]
        json: bool,
    },
    /// Archive every active relay into the backup directory.
    Backup {
        #[arg(long)]
        json: bool,
    },
    /// List backups, newest first.
    Backups {
        #[arg(long)]
        json: bool,
    },
    /// Restore relays from a backup, archiving the current ones first.
    RestoreBackup {
        /// Backup file name as shown by `backups`.
        name: String,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Execute a relay subcommand and return its exit status.
pub async fn run<L: Launcher>(
    action: RelayAction,
    fleet: &Fleet<L>,
    out: &mut impl Write,
) -> anyhow::Result<u8> {
    match action {
        RelayAction::List { deleted, json } => list(fleet, out, deleted, json)?,
        RelayAction::Show { port, json } => show(fleet, out, port, json)?,
        RelayAction::Add {
            label,
            backend,
            expiry,
            start,
            via_launcher,
            json,
        } => {
            if via_launcher {
                let created = fleet.add_via_launcher(&label, &backend, expiry).await?;
                if created.is_empty() {
                    anyhow::bail!("launcher reported success but created no relay");
                }
                for record in &created {
                    print_created(fleet, out, record, json)?;
                }
            } else {
                add(fleet, out, label, backend, expiry, start, json).await?;
            }
        }
        RelayAction::Update {
            port,
            label,
            backend,
            expiry,
        } => {
            let updated = fleet
                .update(port, RelayUpdate { label, backend, expiry })
                .await?;
            writeln!(out, "Updated relay {port}")?;
            if let Some(e) = updated.regenerate_error {
                writeln!(out, "Warning: config regeneration failed: {e}")?;
            }
        }
        RelayAction::Start { port } => {
            let message = match fleet.start(port).await? {
                StartOutcome::Started => "started",
                StartOutcome::AlreadyRunning => "already running",
            };
            writeln!(out, "Relay {port}: {message}")?;
        }
        RelayAction::Stop { port } => {
            let outcome = fleet.stop(port).await?;
            writeln!(out, "Relay {port}: {}", stop_text(outcome))?;
        }
        RelayAction::Restart { port } => {
            fleet.restart(port).await?;
            writeln!(out, "Relay {port}: restarted")?;
        }
        RelayAction::Status { ports } => status(fleet, out, ports)?,
        RelayAction::Delete { port } => {
            let deleted = fleet.delete(port).await?;
            if let Some(e) = &deleted.launcher_error {
                writeln!(out, "Warning: launcher stop failed: {e}")?;
            }
            writeln!(
                out,
                "Relay {port}: {}, moved to the recycle bin",
                stop_text(deleted.stop)
            )?;
        }
        RelayAction::Restore { port } => {
            let record = fleet.restore(port)?;
            writeln!(out, "Restored relay {port} ({})", record.label)?;
        }
        RelayAction::Purge { port, yes } => {
            if !yes && !confirm(&format!("Permanently delete relay {port}?"))? {
                writeln!(out, "Aborted")?;
                return Ok(0);
            }
            fleet.purge(port)?;
            writeln!(out, "Purged relay {port}")?;
        }
        RelayAction::Sweep => {
            let purged = fleet.sweep()?;
            if purged.is_empty() {
                writeln!(out, "Nothing to purge")?;
            } else {
                let ports: Vec<String> = purged.iter().map(ToString::to_string).collect();
                writeln!(out, "Purged: {}", ports.join(", "))?;
            }
        }
        RelayAction::Logs { port, lines, clear } => {
            if clear {
                fleet.clear_logs(port)?;
                writeln!(out, "Cleared log of relay {port}")?;
            } else {
                for line in fleet.logs(port, lines)? {
                    writeln!(out, "{line}")?;
                }
            }
        }
        RelayAction::Test { ports, json } => {
            let report = if ports.is_empty() {
                fleet.test_all().await?
            } else {
                fleet.test_ports(&ports).await
            };
            print_report(out, &report, json)?;
            if !json && report.total > 0 && report.success == 0 {
                return Ok(EXIT_UNHEALTHY);
            }
        }
        RelayAction::Diagnose { port, json } => {
            let diagnosis = fleet.diagnose(port).await?;
            print_diagnosis(out, &diagnosis, json)?;
            if !json && !diagnosis.healthy() {
                return Ok(EXIT_UNHEALTHY);
            }
        }
        RelayAction::Backup { json } => {
            let backup = fleet.backup()?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&backup)?)?;
            } else {
                writeln!(out, "Created backup {} ({} bytes)", backup.name, backup.size)?;
            }
        }
        RelayAction::Backups { json } => list_backups(fleet, out, json)?,
        RelayAction::RestoreBackup { name, yes } => {
            if !yes && !confirm(&format!("Overwrite relay files from backup {name}?"))? {
                writeln!(out, "Aborted")?;
                return Ok(0);
            }
            let restored = fleet.restore_backup(&name)?;
            writeln!(
                out,
                "Restored {} relay(s) from {}; previous state saved as {}",
                restored.relays.len(),
                restored.name,
                restored.pre_restore.name
            )?;
        }
    }
    Ok(0)
}

fn list_backups<L: Launcher>(fleet: &Fleet<L>, out: &mut impl Write, json: bool) -> anyhow::Result<()> {
    let backups = fleet.backups()?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&backups)?)?;
        return Ok(());
    }
    if backups.is_empty() {
        writeln!(out, "No backups")?;
        return Ok(());
    }
    writeln!(out, "{:<36} {:>10} {:<12}", "NAME", "SIZE", "CREATED")?;
    for b in &backups {
        writeln!(out, "{:<36} {:>10} {:<12}", b.name, b.size, b.created_at)?;
    }
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

const fn stop_text(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::NotRunning => "was not running",
        StopOutcome::Terminated => "stopped",
        StopOutcome::Killed => "killed after grace period",
    }
}

async fn add<L: Launcher>(
    fleet: &Fleet<L>,
    out: &mut impl Write,
    label: String,
    backend: String,
    expiry: ExpiryPolicy,
    autostart: bool,
    json: bool,
) -> anyhow::Result<()> {
    let added = fleet
        .add(NewRelay {
            label,
            backend,
            expiry,
            autostart,
        })
        .await?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&added)?)?;
        return Ok(());
    }
    writeln!(out, "Created relay on port {}", added.record.port)?;
    writeln!(out, "Link: {}", added.link)?;
    if let Some(e) = added.start_error {
        writeln!(out, "Warning: relay created but failed to start: {e}")?;
    }
    Ok(())
}

fn print_created<L: Launcher>(
    fleet: &Fleet<L>,
    out: &mut impl Write,
    record: &RelayRecord,
    json: bool,
) -> anyhow::Result<()> {
    let link = record.link(fleet.public_host()).encode();
    if json {
        let value = serde_json::json!({ "record": record, "link": link });
        writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
    } else {
        writeln!(out, "Created relay on port {}", record.port)?;
        writeln!(out, "Link: {link}")?;
    }
    Ok(())
}

fn list<L: Launcher>(
    fleet: &Fleet<L>,
    out: &mut impl Write,
    deleted: bool,
    json: bool,
) -> anyhow::Result<()> {
    let records = if deleted {
        fleet.list_deleted()?
    } else {
        fleet.list()?
    };
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }
    if records.is_empty() {
        let what = if deleted { "No deleted relays" } else { "No relays" };
        writeln!(out, "{what}")?;
        return Ok(());
    }
    let now = unix_timestamp();
    writeln!(
        out,
        "{:<6} {:<24} {:<24} {:<13} {:<10}",
        "PORT", "LABEL", "BACKEND", "STATE", "EXPIRES"
    )?;
    for r in &records {
        writeln!(
            out,
            "{:<6} {:<24} {:<24} {:<13} {:<10}",
            r.port,
            r.label,
            r.backend.to_string(),
            r.lifecycle_state.as_str(),
            expiry_text(r.expires_at, now)
        )?;
    }
    Ok(())
}

fn show<L: Launcher>(
    fleet: &Fleet<L>,
    out: &mut impl Write,
    port: u16,
    json: bool,
) -> anyhow::Result<()> {
    let record = fleet.get(port)?;
    let link = record.link(fleet.public_host()).encode();
    if json {
        let value = serde_json::json!({ "record": record, "link": link });
        writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        return Ok(());
    }
    writeln!(out, "Port:    {}", record.port)?;
    writeln!(out, "Label:   {}", record.label)?;
    writeln!(out, "State:   {}", record.lifecycle_state)?;
    writeln!(out, "Method:  {}", record.credential.method)?;
    writeln!(out, "Backend: {}", record.backend)?;
    if let Some(auth) = &record.backend_auth {
        writeln!(out, "Auth:    {}", auth.user)?;
    }
    writeln!(
        out,
        "Expires: {}",
        expiry_text(record.expires_at, unix_timestamp())
    )?;
    writeln!(out, "Link:    {link}")?;
    Ok(())
}

fn status<L: Launcher>(
    fleet: &Fleet<L>,
    out: &mut impl Write,
    ports: Vec<u16>,
) -> anyhow::Result<()> {
    let ports = if ports.is_empty() {
        fleet.list()?.iter().map(|r| r.port).collect()
    } else {
        ports
    };
    for port in ports {
        let state: LifecycleState = fleet.status(port);
        writeln!(out, "{port:<6} {state}")?;
    }
    Ok(())
}

fn print_report(out: &mut impl Write, report: &TestReport, json: bool) -> anyhow::Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(report)?)?;
        return Ok(());
    }
    for probe in &report.results {
        let label = probe.label.as_deref().unwrap_or("-");
        match (probe.result.reachable, probe.result.latency_ms) {
            (true, Some(ms)) => writeln!(out, "[OK]   {:<6} {label:<24} {ms:.1} ms", probe.port)?,
            _ => writeln!(
                out,
                "[FAIL] {:<6} {label:<24} {}",
                probe.port,
                probe.result.failure_reason.as_deref().unwrap_or("unreachable")
            )?,
        }
    }
    writeln!(
        out,
        "Total: {}, reachable: {}, failed: {}",
        report.total, report.success, report.failed
    )?;
    Ok(())
}

fn print_diagnosis(out: &mut impl Write, diagnosis: &Diagnosis, json: bool) -> anyhow::Result<()> {
    if json {
        let mut value = serde_json::to_value(diagnosis)?;
        value["healthy"] = serde_json::Value::Bool(diagnosis.healthy());
        writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        return Ok(());
    }
    for check in &diagnosis.checks {
        let mark = if check.ok { "ok  " } else { "FAIL" };
        writeln!(out, "[{mark}] {:<13} {}", check.name, check.detail)?;
    }
    if let Some(link) = &diagnosis.link {
        writeln!(out, "Link: {link}")?;
    }
    let verdict = if diagnosis.healthy() {
        "healthy"
    } else {
        "unhealthy"
    };
    writeln!(out, "Relay {}: {verdict}", diagnosis.port)?;
    Ok(())
}

/// `permanent`, `expired`, or whole days left (rounded up).
fn expiry_text(expires_at: Option<u64>, now: u64) -> String {
    match expires_at {
        None | Some(0) => "permanent".to_string(),
        Some(at) if at <= now => "expired".to_string(),
        Some(at) => format!("{}d", (at - now).div_ceil(SECS_PER_DAY)),
    }
}
