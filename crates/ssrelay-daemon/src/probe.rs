//! TCP connectivity probing.
//!
//! A probe resolves the endpoint and opens a TCP connection within a
//! timeout; no protocol handshake is attempted. Batches run on a
//! semaphore-bounded [`JoinSet`] and never abort on individual failures.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use ssrelay_core::{Endpoint, link};

/// Worker count used when a batch is asked for zero workers.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailureKind {
    Timeout,
    Refused,
    Unreachable,
    Resolve,
    Other,
}

impl ProbeFailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Refused => "refused",
            Self::Unreachable => "unreachable",
            Self::Resolve => "resolve",
            Self::Other => "other",
        }
    }

    fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Self::Unreachable
            }
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ProbeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub reachable: bool,
    /// Connect latency in milliseconds, two decimals. Only set when reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ProbeFailureKind>,
}

impl ProbeResult {
    fn reachable(endpoint: Endpoint, elapsed: Duration) -> Self {
        Self {
            endpoint,
            reachable: true,
            latency_ms: Some(round_ms(elapsed)),
            failure_reason: None,
            failure_kind: None,
        }
    }

    pub(crate) fn failed(endpoint: Endpoint, kind: ProbeFailureKind, reason: String) -> Self {
        Self {
            endpoint,
            reachable: false,
            latency_ms: None,
            failure_reason: Some(reason),
            failure_kind: Some(kind),
        }
    }
}

fn round_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

/// Probe one endpoint.
pub async fn probe(endpoint: &Endpoint, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, connect(endpoint)).await {
        Ok(Ok(stream)) => {
            let elapsed = started.elapsed();
            drop(stream);
            debug!(endpoint = %endpoint, latency_ms = round_ms(elapsed), "Probe succeeded");
            ProbeResult::reachable(endpoint.clone(), elapsed)
        }
        Ok(Err((kind, reason))) => {
            debug!(endpoint = %endpoint, %kind, reason = %reason, "Probe failed");
            ProbeResult::failed(endpoint.clone(), kind, reason)
        }
        Err(_) => {
            debug!(endpoint = %endpoint, ?timeout, "Probe timed out");
            ProbeResult::failed(
                endpoint.clone(),
                ProbeFailureKind::Timeout,
                ProbeFailureKind::Timeout.to_string(),
            )
        }
    }
}

async fn connect(endpoint: &Endpoint) -> Result<TcpStream, (ProbeFailureKind, String)> {
    // links carry IPv6 hosts in brackets
    let host = endpoint
        .host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&endpoint.host);

    let addrs: Vec<SocketAddr> = lookup_host((host, endpoint.port))
        .await
        .map_err(|e| (ProbeFailureKind::Resolve, format!("resolve: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err((
            ProbeFailureKind::Resolve,
            format!("resolve: no addresses for {host}"),
        ));
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.map_or_else(
        || (ProbeFailureKind::Other, "other: connect failed".to_string()),
        |e| {
            let kind = ProbeFailureKind::classify(&e);
            (kind, format!("{kind}: {e}"))
        },
    ))
}

/// Probe many endpoints with at most `concurrency` in flight.
///
/// Results come back in completion order; correlate by endpoint.
pub async fn probe_batch(
    endpoints: Vec<Endpoint>,
    timeout: Duration,
    concurrency: usize,
) -> Vec<ProbeResult> {
    let total = endpoints.len();
    let mut set = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(worker_count(concurrency)));
    for endpoint in endpoints {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            probe(&endpoint, timeout).await
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "Probe task failed"),
        }
    }
    results
}

const fn worker_count(concurrency: usize) -> usize {
    if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    }
}

/// Report for one input link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkProbe {
    pub link: String,
    pub label: String,
    /// Absent when the link could not be decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ProbeFailureKind>,
}

/// Decode each link and probe its endpoint. One report per input, in input
/// order; undecodable links are reported, not raised.
pub async fn probe_links(links: &[String], timeout: Duration, concurrency: usize) -> Vec<LinkProbe> {
    let mut set = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(worker_count(concurrency)));
    let mut reports: Vec<Option<LinkProbe>> = vec![None; links.len()];

    for (index, raw) in links.iter().enumerate() {
        match link::decode(raw) {
            Ok(decoded) => {
                let semaphore = Arc::clone(&semaphore);
                let raw = raw.clone();
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = probe(&decoded.endpoint, timeout).await;
                    (index, link_report(raw, decoded.label, result))
                });
            }
            Err(e) => {
                reports[index] = Some(LinkProbe {
                    link: raw.clone(),
                    label: String::new(),
                    endpoint: None,
                    reachable: false,
                    latency_ms: None,
                    failure_reason: Some(format!("invalid link: {e}")),
                    failure_kind: Some(ProbeFailureKind::Other),
                });
            }
        }
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, report)) => reports[index] = Some(report),
            Err(e) => error!(error = %e, "Link probe task failed"),
        }
    }
    reports.into_iter().flatten().collect()
}

fn link_report(link: String, label: String, result: ProbeResult) -> LinkProbe {
    LinkProbe {
        link,
        label,
        endpoint: Some(result.endpoint),
        reachable: result.reachable,
        latency_ms: result.latency_ms,
        failure_reason: result.failure_reason,
        failure_kind: result.failure_kind,
    }
}
