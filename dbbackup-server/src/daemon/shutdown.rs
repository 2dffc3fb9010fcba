//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! On shutdown the scheduler stops first, then running requests are aborted
//! and given a bounded time to finalize before pending writes are flushed.

use crate::services::engine::BackupEngine;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How long aborted requests get to finalize their summaries.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM or SIGINT, then notify subscribers.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        self.trigger();
    }

    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("No task is listening for shutdown");
        }
    }

    /// Stop scheduling, abort running requests and wait for them to finalize.
    pub async fn shutdown(&self, engine: &BackupEngine) {
        info!("Graceful shutdown initiated");
        engine.stop_scheduler().await;

        let running = engine.running();
        if !running.is_empty() {
            if let Err(e) = engine.stop().await {
                error!(error = %e, "Cannot cancel running requests");
            }
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                for group in &running {
                    let _ = engine.wait(group).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(requests = running.len(), "Requests still running at shutdown");
            }
        }

        engine.state().store.flush().await;
        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });

        coordinator.trigger();
        handle.await.unwrap();
    }
}
