//! Coalescing write queue for high-frequency job updates.
//!
//! Updates are collapsed per (job group, database) keeping the highest
//! sequence number, and flushed in one transaction when the batch fills up,
//! when the timer ticks, or immediately for items that demand it.

use crate::db::connection::DbPool;
use crate::db::retry::RetryPolicy;
use crate::models::job::{ProgressUpdate, StatusUpdate};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub trait BatchItem: Clone + Send + Sync + 'static {
    fn key(&self) -> (String, String);
    fn seq(&self) -> i64;
    /// Flush the whole pending batch right after this item is queued.
    fn forces_flush(&self) -> bool {
        false
    }
}

impl BatchItem for ProgressUpdate {
    fn key(&self) -> (String, String) {
        (self.job_group_id.clone(), self.database_name.clone())
    }

    fn seq(&self) -> i64 {
        self.seq
    }
}

impl BatchItem for StatusUpdate {
    fn key(&self) -> (String, String) {
        (self.job_group_id.clone(), self.database_name.clone())
    }

    fn seq(&self) -> i64 {
        self.seq
    }

    fn forces_flush(&self) -> bool {
        self.status.is_terminal()
    }
}

pub type ApplyFn<T> = Arc<dyn Fn(&Connection, &T) -> anyhow::Result<bool> + Send + Sync>;
pub type WrittenFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Writes items to the store, batched or one at a time, with retries.
pub struct Writer<T> {
    pub pool: DbPool,
    pub policy: RetryPolicy,
    pub apply: ApplyFn<T>,
    pub on_written: WrittenFn<T>,
    pub label: &'static str,
}

impl<T> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            policy: self.policy.clone(),
            apply: self.apply.clone(),
            on_written: self.on_written.clone(),
            label: self.label,
        }
    }
}

impl<T: BatchItem> Writer<T> {
    /// Apply all items in a single transaction; returns how many rows changed.
    pub async fn write_batch(&self, items: Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let count = items.len();
        let pool = self.pool.clone();
        let policy = self.policy.clone();
        let apply = self.apply.clone();
        let label = self.label;

        let joined = tokio::task::spawn_blocking(move || {
            let outcome = policy.run_blocking(label, || {
                let mut conn = pool.get()?;
                let tx = conn.transaction()?;
                let mut written = Vec::with_capacity(items.len());
                for item in &items {
                    written.push(apply(&*tx, item)?);
                }
                tx.commit()?;
                Ok(written)
            });
            (items, outcome)
        })
        .await;

        match joined {
            Ok((items, Ok(written))) => {
                let mut changed = 0;
                for (item, applied) in items.iter().zip(written) {
                    if applied {
                        changed += 1;
                        (self.on_written)(item);
                    }
                }
                tracing::trace!(op = label, count, changed, "Flushed batch");
                changed
            }
            Ok((_, Err(e))) => {
                tracing::error!(op = label, count, error = %e, "Failed to flush batch");
                0
            }
            Err(e) => {
                tracing::error!(op = label, count, error = %e, "Batch flush task panicked");
                0
            }
        }
    }

    /// Apply a single item outside the queue.
    pub async fn write_one(&self, item: T) -> anyhow::Result<bool> {
        let apply = self.apply.clone();
        let owned = item.clone();
        let applied = self
            .policy
            .run_db(&self.pool, self.label, move |conn| apply(&*conn, &owned))
            .await?;
        if applied {
            (self.on_written)(&item);
        }
        Ok(applied)
    }
}

enum Msg<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

pub struct WriteBatcher<T> {
    tx: mpsc::Sender<Msg<T>>,
    writer: Writer<T>,
}

impl<T: BatchItem> WriteBatcher<T> {
    /// Start the background flush loop. Must be called inside a tokio runtime.
    pub fn spawn(writer: Writer<T>, options: BatchOptions) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let handle = tokio::spawn(run_loop(rx, writer.clone(), options));
        (Self { tx, writer }, handle)
    }

    /// Queue an update; when the queue is full (or gone) write it directly so
    /// nothing is dropped.
    pub async fn push(&self, item: T) {
        let item = match self.tx.try_send(Msg::Item(item)) {
            Ok(()) => return,
            Err(TrySendError::Full(Msg::Item(item))) => {
                tracing::debug!(op = self.writer.label, "Write queue full, writing directly");
                item
            }
            Err(TrySendError::Closed(Msg::Item(item))) => item,
            Err(_) => return,
        };
        if let Err(e) = self.writer.write_one(item).await {
            tracing::error!(op = self.writer.label, error = %e, "Direct write failed");
        }
    }

    /// Wait until everything queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn collapse<T: BatchItem>(pending: &mut HashMap<(String, String), T>, item: T) {
    match pending.get(&item.key()) {
        Some(existing) if existing.seq() >= item.seq() => {}
        _ => {
            pending.insert(item.key(), item);
        }
    }
}

async fn run_loop<T: BatchItem>(mut rx: mpsc::Receiver<Msg<T>>, writer: Writer<T>, options: BatchOptions) {
    let mut pending: HashMap<(String, String), T> = HashMap::new();
    let mut received = 0usize;
    let mut ticker = tokio::time::interval(options.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Msg::Item(item)) => {
                    let force = item.forces_flush();
                    collapse(&mut pending, item);
                    received += 1;
                    if force || received >= options.batch_size {
                        writer.write_batch(pending.drain().map(|(_, v)| v).collect()).await;
                        received = 0;
                    }
                }
                Some(Msg::Flush(done)) => {
                    writer.write_batch(pending.drain().map(|(_, v)| v).collect()).await;
                    received = 0;
                    let _ = done.send(());
                }
                None => {
                    writer.write_batch(pending.drain().map(|(_, v)| v).collect()).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    writer.write_batch(pending.drain().map(|(_, v)| v).collect()).await;
                    received = 0;
                }
            }
        }
    }
    tracing::debug!(op = writer.label, "Write batcher stopped");
}
