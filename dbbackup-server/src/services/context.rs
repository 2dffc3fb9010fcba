//! State shared by all workers of one backup request.

use crate::models::summary::Totals;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

/// Per-request coordination: abort, concurrency slots, the restart flag and
/// the running totals. A new request gets a new context, so an abort never
/// leaks into the next run.
pub struct RunContext {
    job_group_id: String,
    parallelism: usize,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
    restarting: AtomicBool,
    restart_generation: AtomicU64,
    totals: Mutex<Totals>,
    finished: watch::Sender<bool>,
}

impl RunContext {
    pub fn new(job_group_id: impl Into<String>, parallelism: usize, seed: Totals) -> Self {
        let parallelism = parallelism.max(1);
        let (finished, _) = watch::channel(false);
        Self {
            job_group_id: job_group_id.into(),
            parallelism,
            cancel: CancellationToken::new(),
            slots: Arc::new(Semaphore::new(parallelism)),
            restarting: AtomicBool::new(false),
            restart_generation: AtomicU64::new(0),
            totals: Mutex::new(seed),
            finished,
        }
    }

    pub fn job_group_id(&self) -> &str {
        &self.job_group_id
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    // ── Abort ──

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── Slots ──

    /// Wait for a concurrency slot; `None` once the request is aborted.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Take every slot, i.e. wait until no unit is in flight.
    pub async fn drain(&self) -> Option<SemaphorePermit<'_>> {
        tokio::select! {
            permits = self.slots.acquire_many(self.parallelism as u32) => permits.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.parallelism - self.slots.available_permits()
    }

    // ── Restart coordination ──

    /// Claim the coordinator role. Only one caller wins until `end_restart`.
    pub fn try_begin_restart(&self) -> bool {
        self.restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_restart(&self) {
        self.restart_generation.fetch_add(1, Ordering::AcqRel);
        self.restarting.store(false, Ordering::Release);
    }

    pub fn restart_in_progress(&self) -> bool {
        self.restarting.load(Ordering::Acquire)
    }

    /// Bumped after every restart cycle, so a worker can tell whether one ran
    /// while it was waiting for a slot.
    pub fn restart_generation(&self) -> u64 {
        self.restart_generation.load(Ordering::Acquire)
    }

    // ── Totals ──

    /// Lock the running totals. Hold the guard while persisting them so
    /// snapshots reach the store in order.
    pub async fn totals(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().await
    }

    // ── Completion ──

    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn only_one_coordinator_at_a_time() {
        let ctx = RunContext::new("g1", 2, Totals::default());
        assert!(ctx.try_begin_restart());
        assert!(!ctx.try_begin_restart());
        assert!(ctx.restart_in_progress());
        ctx.end_restart();
        assert!(!ctx.restart_in_progress());
        assert_eq!(ctx.restart_generation(), 1);
        assert!(ctx.try_begin_restart());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_units() {
        let ctx = Arc::new(RunContext::new("g1", 2, Totals::default()));
        let held = ctx.acquire_slot().await.unwrap();
        assert_eq!(ctx.in_flight(), 1);

        let drainer = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let all = ctx.drain().await;
                all.is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());

        drop(held);
        assert!(drainer.await.unwrap());
        assert_eq!(ctx.in_flight(), 0);
    }

    #[tokio::test]
    async fn abort_releases_slot_waiters() {
        let ctx = Arc::new(RunContext::new("g1", 1, Totals::default()));
        let _held = ctx.acquire_slot().await.unwrap();

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.acquire_slot().await.is_none() })
        };
        ctx.abort();
        assert!(waiter.await.unwrap());
        assert!(ctx.is_aborted());
    }

    #[tokio::test]
    async fn wait_finished_returns_after_mark() {
        let ctx = Arc::new(RunContext::new("g1", 1, Totals::default()));
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_finished().await })
        };
        ctx.mark_finished();
        waiter.await.unwrap();
        // Already finished: returns immediately
        ctx.wait_finished().await;
    }
}
