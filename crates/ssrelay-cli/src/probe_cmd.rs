//! `ssrelay probe`: TCP reachability of ss:// links.
//!
//! Exit status: 1 when there is nothing to probe (including an unreadable
//! link file), 2 when no link is reachable, 0 otherwise. JSON output always
//! exits 0 once probing ran.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use ssrelay_core::config::ProbeConfig;
use ssrelay_daemon::probe::{LinkProbe, probe_links};

/// Exit status when no link is reachable.
pub const EXIT_NONE_REACHABLE: u8 = 2;

const SCHEME: &str = "ss://";

/// Arguments for the `probe` subcommand.
#[derive(clap::Args, Debug, Default)]
pub struct ProbeArgs {
    /// Links to probe.
    pub links: Vec<String>,

    /// File with one link per line; lines not starting with ss:// are ignored.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Per-link connect timeout in seconds [default: 10]
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Links probed at once [default: 5]
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    results: &'a [LinkProbe],
    total: usize,
    reachable: usize,
    unreachable: usize,
}

/// Execute the probe subcommand and return its exit status.
pub async fn run(args: ProbeArgs, defaults: &ProbeConfig, out: &mut impl Write) -> anyhow::Result<u8> {
    let mut links = args.links;
    if let Some(path) = &args.file {
        let from_file = read_link_file(path)
            .with_context(|| format!("reading link file {}", path.display()))?;
        links.extend(from_file);
    }
    if links.is_empty() {
        anyhow::bail!("no links to probe (pass links or --file <path>)");
    }

    let timeout = Duration::from_secs(args.timeout.unwrap_or(defaults.timeout_secs));
    let workers = args.workers.unwrap_or(defaults.workers);
    info!(links = links.len(), workers, timeout_secs = timeout.as_secs(), "Probing links");

    let results = probe_links(&links, timeout, workers).await;
    let reachable = results.iter().filter(|r| r.reachable).count();

    if args.json {
        let summary = Summary {
            results: &results,
            total: results.len(),
            reachable,
            unreachable: results.len() - reachable,
        };
        writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
        return Ok(0);
    }

    for result in &results {
        writeln!(out, "{}", format_result(result))?;
    }
    writeln!(out, "{reachable}/{} reachable", results.len())?;
    Ok(if reachable == 0 { EXIT_NONE_REACHABLE } else { 0 })
}

/// Trimmed lines of `path` that look like links.
pub fn read_link_file(path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(SCHEME))
        .map(str::to_string)
        .collect())
}

fn format_result(result: &LinkProbe) -> String {
    let target = result
        .endpoint
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    let label = if result.label.is_empty() {
        "-"
    } else {
        result.label.as_str()
    };
    match (result.reachable, result.latency_ms) {
        (true, Some(ms)) => format!("[OK]   {label:<24} {target:<28} {ms:.1} ms"),
        _ => format!(
            "[FAIL] {label:<24} {target:<28} {}",
            result.failure_reason.as_deref().unwrap_or("unreachable")
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use ssrelay_core::{Endpoint, RelayCredential, link};
    use tokio::net::TcpListener;

    fn link_to(port: u16, label: &str) -> String {
        link::encode(
            &RelayCredential::new("aes-256-gcm", "pw"),
            &Endpoint::new("127.0.0.1", port),
            label,
        )
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn args(links: Vec<String>) -> ProbeArgs {
        ProbeArgs {
            links,
            timeout: Some(2),
            ..ProbeArgs::default()
        }
    }

    #[test]
    fn link_file_keeps_only_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.txt");
        std::fs::write(&path, "# exported\n  ss://abc@h:1#a  \n\nvmess://x\nss://def@h:2\n").unwrap();
        assert_eq!(
            read_link_file(&path).unwrap(),
            vec!["ss://abc@h:1#a", "ss://def@h:2"]
        );
    }

    #[tokio::test]
    async fn nothing_to_probe_is_an_error() {
        let mut out = Vec::new();
        assert!(run(args(Vec::new()), &ProbeConfig::default(), &mut out).await.is_err());

        let mut missing = args(Vec::new());
        missing.file = Some(PathBuf::from("/nonexistent/links.txt"));
        assert!(run(missing, &ProbeConfig::default(), &mut out).await.is_err());
    }

    #[tokio::test]
    async fn exit_status_follows_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = listener.local_addr().unwrap().port();
        let down = closed_port().await;

        let mut out = Vec::new();
        let code = run(
            args(vec![link_to(up, "up"), link_to(down, "down")]),
            &ProbeConfig::default(),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[OK]   up"));
        assert!(text.contains("[FAIL] down"));
        assert!(text.ends_with("1/2 reachable\n"));

        let mut out = Vec::new();
        let code = run(args(vec![link_to(down, "down")]), &ProbeConfig::default(), &mut out)
            .await
            .unwrap();
        assert_eq!(code, EXIT_NONE_REACHABLE);
        drop(listener);
    }

    #[tokio::test]
    async fn json_mode_always_exits_zero() {
        let down = closed_port().await;
        let mut json_args = args(vec![link_to(down, "down"), "not-a-link".to_string()]);
        json_args.json = true;

        let mut out = Vec::new();
        let code = run(json_args, &ProbeConfig::default(), &mut out).await.unwrap();
        assert_eq!(code, 0);

        let summary: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(summary["total"], 2);
        assert_eq!(summary["unreachable"], 2);
        assert_eq!(summary["results"][1]["link"], "not-a-link");
        assert!(
            summary["results"][1]["failure_reason"]
                .as_str()
                .unwrap()
                .starts_with("invalid link")
        );
    }
}
