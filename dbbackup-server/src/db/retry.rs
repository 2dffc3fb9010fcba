//! Retry policy for store operations that can hit SQLite lock contention.

use crate::config::StoreConfig;
use crate::db::connection::DbPool;
use rand::Rng;
use rusqlite::{Connection, ErrorCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an error is worth another attempt.
pub type Classifier = fn(&anyhow::Error) -> bool;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    classifier: Classifier,
}

/// True when any error in the chain is SQLITE_BUSY or SQLITE_LOCKED.
pub fn is_lock_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    })
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            classifier: is_lock_contention,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_base_millis),
            Duration::from_millis(config.retry_max_millis),
        )
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn is_retryable(&self, err: &anyhow::Error) -> bool {
        (self.classifier)(err)
    }

    /// Exponential delay for the given 1-based attempt plus up to 50% jitter,
    /// never above `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let jitter_cap = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_cap > 0 {
            rand::rng().random_range(0..=jitter_cap)
        } else {
            0
        };
        (exp + Duration::from_millis(jitter)).min(self.max_delay)
    }

    /// Run an async operation, retrying retryable errors with backoff.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts && self.is_retryable(&e) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(op = label, attempt, ?delay, "Store busy, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if self.is_retryable(&e) {
                        tracing::warn!(op = label, attempts = attempt, error = %e, "Store still busy after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Blocking variant for code already running on a blocking thread.
    pub fn run_blocking<T, F>(&self, label: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts && self.is_retryable(&e) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(op = label, attempt, ?delay, "Store busy, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `op` against a pooled connection on the blocking pool, one
    /// `spawn_blocking` per attempt.
    pub async fn run_db<T, F>(&self, pool: &DbPool, label: &str, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        self.run(label, || {
            let pool = pool.clone();
            let op = op.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    op(&mut conn)
                })
                .await
                .map_err(|e| anyhow::anyhow!(e))?
            }
        })
        .await
    }
}
