#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Connectivity prober against local listeners.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use ssrelay_core::Endpoint;
use ssrelay_daemon::probe::{ProbeFailureKind, probe, probe_batch};

/// A port that had a listener a moment ago and has none now.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A listener whose accept queue is full, so further connects hang. The
/// returned streams keep the queue occupied.
async fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut held = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => held.push(stream),
            _ => break,
        }
    }
    (listener, held)
}

#[tokio::test]
async fn nothing_listening_is_unreachable_within_timeout() {
    let port = closed_port().await;
    let timeout = Duration::from_secs(1);

    let started = Instant::now();
    let result = probe(&Endpoint::new("127.0.0.1", port), timeout).await;

    assert!(!result.reachable);
    assert!(result.latency_ms.is_none());
    assert!(!result.failure_reason.unwrap_or_default().is_empty());
    assert!(started.elapsed() < timeout + Duration::from_millis(500));
}

#[tokio::test]
async fn batch_of_ten_is_fully_tagged() {
    let mut listeners = Vec::new();
    let mut reachable = HashSet::new();
    for _ in 0..7 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        reachable.insert(listener.local_addr().unwrap().port());
        listeners.push(listener);
    }
    // hold all three at once so the ports are distinct, then close them
    let mut closing = Vec::new();
    for _ in 0..3 {
        closing.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let unreachable: HashSet<u16> = closing
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();
    drop(closing);

    let endpoints: Vec<Endpoint> = reachable
        .iter()
        .chain(unreachable.iter())
        .map(|port| Endpoint::new("127.0.0.1", *port))
        .collect();
    let timeout = Duration::from_secs(2);

    let started = Instant::now();
    let results = probe_batch(endpoints, timeout, 5).await;
    assert!(started.elapsed() < timeout * 2);

    assert_eq!(results.len(), 10);
    for result in &results {
        let port = result.endpoint.port;
        if reachable.contains(&port) {
            assert!(result.reachable, "port {port} should be reachable");
            assert!(result.latency_ms.is_some());
        } else {
            assert!(unreachable.contains(&port));
            assert!(!result.reachable, "port {port} should be unreachable");
            assert!(result.failure_reason.is_some());
        }
    }
    drop(listeners);
}

#[tokio::test]
async fn empty_batch_returns_nothing() {
    assert!(probe_batch(Vec::new(), Duration::from_secs(1), 0).await.is_empty());
}

#[tokio::test]
async fn single_worker_still_completes_everything() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let endpoints = vec![Endpoint::new("127.0.0.1", port); 4];

    let results = probe_batch(endpoints, Duration::from_secs(2), 1).await;
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.reachable));
}

#[tokio::test]
async fn hanging_endpoint_times_out() {
    let (listener, _held) = saturated_listener().await;
    let port = listener.local_addr().unwrap().port();
    let timeout = Duration::from_secs(1);

    let started = Instant::now();
    let result = probe(&Endpoint::new("127.0.0.1", port), timeout).await;
    let elapsed = started.elapsed();

    assert!(!result.reachable);
    assert_eq!(result.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(result.failure_kind, Some(ProbeFailureKind::Timeout));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
}

#[tokio::test]
async fn hanging_endpoints_only_cost_their_own_timeout() {
    let mut saturated = Vec::new();
    let mut hanging = HashSet::new();
    for _ in 0..3 {
        let (listener, held) = saturated_listener().await;
        hanging.insert(listener.local_addr().unwrap().port());
        saturated.push((listener, held));
    }
    let mut listeners = Vec::new();
    for _ in 0..7 {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }

    let endpoints: Vec<Endpoint> = hanging
        .iter()
        .copied()
        .chain(listeners.iter().map(|l| l.local_addr().unwrap().port()))
        .map(|port| Endpoint::new("127.0.0.1", port))
        .collect();
    let timeout = Duration::from_secs(1);

    let started = Instant::now();
    let results = probe_batch(endpoints, timeout, 5).await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 10);
    assert!(elapsed < timeout * 2, "batch took {elapsed:?}");
    for result in &results {
        if hanging.contains(&result.endpoint.port) {
            assert_eq!(result.failure_reason.as_deref(), Some("timeout"));
        } else {
            assert!(result.reachable, "port {} should be reachable", result.endpoint.port);
        }
    }
    drop(saturated);
    drop(listeners);
}
