//! ssrelay CLI
//!
//! Operator interface: encode and decode links, probe them, and manage the
//! relays registered on this host.

use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::debug;

use ssrelay_cli::context::{self, GlobalArgs};
use ssrelay_cli::link_cmd::{self, LinkAction};
use ssrelay_cli::probe_cmd::{self, ProbeArgs};
use ssrelay_cli::relay_cmd::{self, RelayAction};

const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Parser, Debug)]
#[command(name = "ssrelay")]
#[command(version, about = "Shadowsocks relay fleet manager", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    /// Log level filter (e.g. "warn", "info", "debug") [default: fleet.log_level, else warn]
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "SSRELAY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode or decode ss:// links.
    Link {
        #[command(subcommand)]
        action: LinkAction,
    },
    /// Check TCP reachability of ss:// links.
    Probe(ProbeArgs),
    #[command(flatten)]
    Relay(RelayAction),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    // `link` works without a usable configuration.
    let config = cli.global.load_config();

    let log_level = cli
        .log_level
        .or_else(|| config.as_ref().ok().and_then(|c| c.fleet.log_level.clone()))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    let log_filter = format!("ssrelay_cli={log_level},ssrelay_daemon={log_level},ssrelay_core={log_level}");
    ssrelay_core::tracing_init::init_tracing(&log_filter, cli.log_json);
    debug!(version = env!("CARGO_PKG_VERSION"), "Starting ssrelay CLI");

    let mut out = io::stdout();
    let code = match cli.command {
        Commands::Link { action } => {
            link_cmd::run(action, &mut out)?;
            0
        }
        Commands::Probe(args) => {
            let config = config?;
            probe_cmd::run(args, &config.probe, &mut out).await?
        }
        Commands::Relay(action) => {
            let config = config?;
            let fleet = context::open_fleet(&config)?;
            relay_cmd::run(action, &fleet, &mut out).await?
        }
    };
    Ok(ExitCode::from(code))
}
