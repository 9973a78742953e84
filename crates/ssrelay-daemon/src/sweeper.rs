//! Periodic purge of expired recycle bin entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ssrelay_core::config::RecycleConfig;
use ssrelay_core::model::unix_timestamp;

use crate::registry::Registry;

/// Background task that sweeps the recycle bin every interval.
pub struct RecycleSweeper {
    registry: Arc<Registry>,
    retention: Duration,
    interval: Duration,
    running: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl RecycleSweeper {
    pub fn new(registry: Arc<Registry>, config: &RecycleConfig) -> Self {
        Self {
            registry,
            retention: config.retention(),
            interval: config.sweep_interval(),
            running: None,
        }
    }

    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Sweep once now. Returns the purged ports.
    pub fn sweep_once(&self) -> Vec<u16> {
        sweep(&self.registry, self.retention)
    }

    /// Spawn the periodic task. Calling `start` twice has no effect.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let retention = self.retention;
        let period = self.interval.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            info!(
                retention_days = retention.as_secs() / 86_400,
                interval_secs = period.as_secs(),
                "Recycle sweeper started"
            );
            let mut timer = tokio::time::interval(period);
            // Skip the first immediate tick
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        sweep(&registry, retention);
                    }
                    _ = shutdown.changed() => {
                        info!("Recycle sweeper shutting down");
                        break;
                    }
                }
            }
        });
        self.running = Some((shutdown_tx, handle));
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some((shutdown_tx, handle)) = self.running.take() {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Recycle sweeper task ended abnormally");
            }
        }
    }
}

fn sweep(registry: &Registry, retention: Duration) -> Vec<u16> {
    match registry.sweep(retention, unix_timestamp()) {
        Ok(purged) => purged,
        Err(e) => {
            warn!(error = %e, "Recycle sweep failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path()).unwrap());
        let mut sweeper = RecycleSweeper::new(registry, &RecycleConfig::default());

        sweeper.start();
        sweeper.start();
        assert!(sweeper.is_running());

        tokio::time::timeout(Duration::from_secs(2), sweeper.stop())
            .await
            .unwrap();
        assert!(!sweeper.is_running());
        // stopping again is a no-op
        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path()).unwrap());
        let record = ssrelay_core::RelayRecord {
            port: 41000,
            label: "old".into(),
            backend: ssrelay_core::Endpoint::new("10.0.0.1", 1080),
            backend_auth: None,
            credential: ssrelay_core::RelayCredential::generate(),
            created_at: 0,
            expires_at: None,
            lifecycle_state: ssrelay_core::LifecycleState::Stopped,
            soft_deleted_at: None,
        };
        registry.create(&record).unwrap();
        registry.soft_delete(41000, 0).unwrap();

        let config = RecycleConfig {
            retention_days: 1,
            sweep_interval_secs: 60,
        };
        let mut sweeper = RecycleSweeper::new(Arc::clone(&registry), &config);
        sweeper.start();
        assert!(registry.is_reserved(41000));

        tokio::time::sleep(Duration::from_secs(61)).await;
        // let the sweep task run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!registry.is_reserved(41000));
        sweeper.stop().await;
    }
}
