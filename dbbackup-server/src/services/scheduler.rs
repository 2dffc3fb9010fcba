//! Periodic backup runs anchored to a daily start time.

use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::models::summary::BackupMode;
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const TICK: std::time::Duration = std::time::Duration::from_secs(60);

/// What a scheduled run does; implemented by the engine.
#[async_trait]
pub trait ScheduledWork: Send + Sync + 'static {
    /// Start a run and return its job group id.
    async fn run_scheduled(&self, mode: BackupMode) -> Result<String>;

    async fn cleanup(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub start_time: String,
    pub interval_hours: u64,
    pub default_mode: BackupMode,
    pub next_run: Option<NaiveDateTime>,
    pub last_run: Option<NaiveDateTime>,
    pub last_group_id: Option<String>,
}

/// Next run strictly after `now`: today's start time if it is still ahead,
/// otherwise the start time plus the smallest whole number of intervals that
/// lands in the future.
pub fn next_run(now: NaiveDateTime, start: NaiveTime, interval: Duration) -> NaiveDateTime {
    let anchor = now.date().and_time(start);
    if anchor > now {
        return anchor;
    }
    let step = interval.num_milliseconds().max(1);
    let elapsed = (now - anchor).num_milliseconds();
    anchor + Duration::milliseconds(step * (elapsed / step + 1))
}

#[derive(Default)]
struct Inner {
    token: Option<CancellationToken>,
    next_run: Option<NaiveDateTime>,
    last_run: Option<NaiveDateTime>,
    last_group_id: Option<String>,
}

pub struct Scheduler {
    config: ScheduleConfig,
    tick: std::time::Duration,
    inner: Arc<Mutex<Inner>>,
}

impl Scheduler {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            tick: TICK,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Start ticking. Returns false when the interval is zero, which keeps
    /// the scheduler stopped for good.
    pub async fn start(&self, work: Arc<dyn ScheduledWork>) -> Result<bool> {
        let Some(interval) = self.config.interval() else {
            tracing::info!("Scheduler disabled: interval is zero");
            return Ok(false);
        };
        let start_time = self.config.start_time()?;

        let mut inner = self.inner.lock().await;
        if inner.token.is_some() {
            return Ok(true);
        }
        let next = next_run(Local::now().naive_local(), start_time, interval);
        inner.next_run = Some(next);
        let token = CancellationToken::new();
        inner.token = Some(token.clone());
        drop(inner);

        tracing::info!(next_run = %next, interval_hours = self.config.interval_hours, "Scheduler started");
        tokio::spawn(run_loop(
            self.inner.clone(),
            work,
            LoopSettings {
                start_time,
                interval,
                tick: self.tick,
                mode: self.config.default_mode,
                retention_delay: std::time::Duration::from_secs(self.config.retention_delay_secs),
            },
            token,
        ));
        Ok(true)
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.token.take() {
            token.cancel();
            inner.next_run = None;
            tracing::info!("Scheduler stopped");
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let inner = self.inner.lock().await;
        SchedulerStatus {
            state: if inner.token.is_some() {
                SchedulerState::Running
            } else {
                SchedulerState::Stopped
            },
            start_time: self.config.start_time.clone(),
            interval_hours: self.config.interval_hours,
            default_mode: self.config.default_mode,
            next_run: inner.next_run,
            last_run: inner.last_run,
            last_group_id: inner.last_group_id.clone(),
        }
    }
}

struct LoopSettings {
    start_time: NaiveTime,
    interval: Duration,
    tick: std::time::Duration,
    mode: BackupMode,
    retention_delay: std::time::Duration,
}

async fn run_loop(inner: Arc<Mutex<Inner>>, work: Arc<dyn ScheduledWork>, settings: LoopSettings, token: CancellationToken) {
    let mut ticker = tokio::time::interval(settings.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Local::now().naive_local();
        let due = inner.lock().await.next_run.is_some_and(|at| now >= at);
        if !due {
            continue;
        }

        tracing::info!(mode = %settings.mode, "Starting scheduled backup");
        let group = match work.run_scheduled(settings.mode).await {
            Ok(group) => Some(group),
            Err(e) => {
                tracing::error!(error = %e, "Scheduled backup was not started");
                None
            }
        };
        {
            let mut inner = inner.lock().await;
            inner.last_run = Some(now);
            inner.last_group_id = group;
            inner.next_run = Some(next_run(now, settings.start_time, settings.interval));
        }

        let work = work.clone();
        let token = token.clone();
        let delay = settings.retention_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => work.cleanup().await,
                _ = token.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 5, d).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn runs_today_when_start_time_is_ahead() {
        assert_eq!(next_run(at(10, 1, 0), hm(2, 0), Duration::hours(24)), at(10, 2, 0));
    }

    #[test]
    fn steps_whole_intervals_past_start_time() {
        assert_eq!(next_run(at(10, 9, 30), hm(2, 0), Duration::hours(6)), at(10, 14, 0));
        assert_eq!(next_run(at(10, 23, 0), hm(2, 0), Duration::hours(6)), at(11, 2, 0));
        assert_eq!(next_run(at(10, 3, 0), hm(2, 0), Duration::hours(24)), at(11, 2, 0));
    }

    #[test]
    fn exactly_at_start_time_moves_to_next_interval() {
        assert_eq!(next_run(at(10, 2, 0), hm(2, 0), Duration::hours(12)), at(10, 14, 0));
    }

    #[test]
    fn next_run_is_always_in_the_future() {
        for hour in 0..24 {
            let now = at(10, hour, 17);
            for interval in [1, 5, 8, 24, 48] {
                assert!(next_run(now, hm(2, 30), Duration::hours(interval)) > now);
            }
        }
    }

    #[derive(Default)]
    struct CountingWork {
        runs: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledWork for CountingWork {
        async fn run_scheduled(&self, _mode: BackupMode) -> Result<String> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(format!("group-{n}"))
        }

        async fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(interval_hours: u64) -> ScheduleConfig {
        ScheduleConfig {
            interval_hours,
            retention_delay_secs: 0,
            ..ScheduleConfig::default()
        }
    }

    #[tokio::test]
    async fn zero_interval_stays_stopped() {
        let scheduler = Scheduler::new(config(0));
        let started = scheduler.start(Arc::new(CountingWork::default())).await.unwrap();
        assert!(!started);
        assert_eq!(scheduler.status().await.state, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let scheduler = Scheduler::new(config(24));
        assert!(scheduler.start(Arc::new(CountingWork::default())).await.unwrap());

        let status = scheduler.status().await;
        assert_eq!(status.state, SchedulerState::Running);
        assert!(status.next_run.unwrap() > Local::now().naive_local());

        scheduler.stop().await;
        let status = scheduler.status().await;
        assert_eq!(status.state, SchedulerState::Stopped);
        assert!(status.next_run.is_none());
    }

    #[tokio::test]
    async fn due_run_triggers_work_and_cleanup() {
        let mut scheduler = Scheduler::new(config(24));
        scheduler.tick = std::time::Duration::from_millis(10);
        let work = Arc::new(CountingWork::default());
        scheduler.start(work.clone()).await.unwrap();
        scheduler.inner.lock().await.next_run = Some(Local::now().naive_local() - Duration::seconds(1));

        for _ in 0..100 {
            if work.cleanups.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(work.runs.load(Ordering::SeqCst), 1);
        assert_eq!(work.cleanups.load(Ordering::SeqCst), 1);

        let status = scheduler.status().await;
        assert_eq!(status.last_group_id.as_deref(), Some("group-0"));
        assert!(status.last_run.is_some());
        assert!(status.next_run.unwrap() > Local::now().naive_local());
        scheduler.stop().await;
    }
}
