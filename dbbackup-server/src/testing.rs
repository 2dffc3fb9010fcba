//! Test doubles for the engine's external collaborators.

use crate::config::StoreConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::error::UnitError;
use crate::models::summary::Summary;
use crate::notify::{ChangeNotifier, SummaryNotifier};
use crate::services::admission::{MemorySampler, ServiceControl};
use crate::services::progress::ProgressSource;
use crate::services::tools::{DatabaseTools, DumpOutcome, DumpTarget, Window};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Migrated on-disk store with a fast flush interval.
pub fn store(dir: &Path) -> Store {
    let pool = create_pool(dir.join("state.db").to_str().unwrap(), Duration::from_millis(100)).unwrap();
    migrate(&pool).unwrap();
    let config = StoreConfig {
        flush_interval_millis: 10,
        completion_grace_millis: 0,
        ..StoreConfig::default()
    };
    Store::new(pool, &config, ChangeNotifier::new())
}

// ── Memory ──

pub struct FakeSampler {
    value: Mutex<Option<f64>>,
    script: Mutex<VecDeque<f64>>,
}

impl FakeSampler {
    pub fn new(value: f64) -> Self {
        Self {
            value: Mutex::new(Some(value)),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            value: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.lock().unwrap() = Some(value);
    }

    /// Readings returned once each, before falling back to the set value.
    pub fn script(&self, readings: &[f64]) {
        self.script.lock().unwrap().extend(readings.iter().copied());
    }
}

impl MemorySampler for FakeSampler {
    fn used_percent(&self) -> Option<f64> {
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return Some(next);
        }
        *self.value.lock().unwrap()
    }
}

// ── Service ──

pub struct FakeService {
    alive_after: Option<usize>,
    restarts: AtomicUsize,
    pings: AtomicUsize,
    recovery: Mutex<Option<(Arc<FakeSampler>, f64)>>,
}

impl FakeService {
    /// Answers on the first ping after a restart.
    pub fn healthy() -> Self {
        Self::alive_after(1)
    }

    pub fn alive_after(pings: usize) -> Self {
        Self {
            alive_after: Some(pings),
            restarts: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            recovery: Mutex::new(None),
        }
    }

    pub fn never_alive() -> Self {
        Self {
            alive_after: None,
            ..Self::healthy()
        }
    }

    /// Drop the sampler to `value` when the service restarts.
    pub fn recover_sampler(&self, sampler: Arc<FakeSampler>, value: f64) {
        *self.recovery.lock().unwrap() = Some((sampler, value));
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceControl for FakeService {
    async fn restart(&self) -> anyhow::Result<String> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.pings.store(0, Ordering::SeqCst);
        if let Some((sampler, value)) = self.recovery.lock().unwrap().as_ref() {
            sampler.set(*value);
        }
        Ok("mysql".into())
    }

    async fn is_alive(&self) -> bool {
        let n = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
        self.alive_after.is_some_and(|after| n >= after)
    }
}

// ── Database tools ──

pub struct FakeTools {
    databases: Vec<String>,
    delay: Duration,
    size_delay: Duration,
    binlog_format: Mutex<String>,
    failing: Mutex<HashSet<String>>,
    optimize_failing: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Vec<String>>,
    windows: Mutex<Vec<(String, Window)>>,
}

impl FakeTools {
    /// `databases` is what the server lists, on top of its system schemas.
    pub fn new(databases: &[&str]) -> Self {
        Self {
            databases: databases.iter().map(|s| s.to_string()).collect(),
            delay: Duration::ZERO,
            size_delay: Duration::ZERO,
            binlog_format: Mutex::new("ROW".into()),
            failing: Mutex::new(HashSet::new()),
            optimize_failing: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Slow down the size estimate taken just before a unit starts.
    pub fn with_size_delay(mut self, delay: Duration) -> Self {
        self.size_delay = delay;
        self
    }

    pub fn fail(&self, database: &str) {
        self.failing.lock().unwrap().insert(database.to_string());
    }

    pub fn recover(&self, database: &str) {
        self.failing.lock().unwrap().remove(database);
    }

    pub fn fail_optimize(&self, database: &str) {
        self.optimize_failing.lock().unwrap().insert(database.to_string());
    }

    pub fn set_binlog_format(&self, format: &str) {
        *self.binlog_format.lock().unwrap() = format.to_string();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `start:<db>` / `end:<db>` in the order dumps began and ended.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Databases whose dump started, in order.
    pub fn dumped(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
            .collect()
    }

    pub fn windows(&self) -> Vec<(String, Window)> {
        self.windows.lock().unwrap().clone()
    }

    pub async fn wait_started(&self, database: &str) {
        let marker = format!("start:{database}");
        while !self.events.lock().unwrap().contains(&marker) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn dump(&self, target: &DumpTarget, report: watch::Sender<i64>) -> Result<DumpOutcome, UnitError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("start:{}", target.database));

        let _ = report.send(50);
        tokio::time::sleep(self.delay).await;
        let body = format!("-- dump of {}\n", target.database);
        let written = tokio::fs::write(&target.output, &body).await;

        self.events.lock().unwrap().push(format!("end:{}", target.database));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        written.map_err(|e| UnitError::Write(e.to_string()))?;
        if self.failing.lock().unwrap().contains(&target.database) {
            return Err(UnitError::Process("mysqldump exit status: 2: Got error: 2013".into()));
        }
        Ok(DumpOutcome {
            bytes: body.len() as u64,
            disk_bytes: body.len() as u64,
        })
    }
}

#[async_trait]
impl DatabaseTools for FakeTools {
    async fn preflight(&self) -> crate::error::Result<()> {
        Ok(())
    }

    async fn list_databases(&self) -> anyhow::Result<Vec<String>> {
        let mut all = vec!["information_schema".to_string(), "mysql".to_string()];
        all.extend(self.databases.iter().cloned());
        Ok(all)
    }

    async fn table_count(&self, _database: &str) -> anyhow::Result<u64> {
        Ok(3)
    }

    async fn database_size(&self, _database: &str) -> anyhow::Result<Option<i64>> {
        tokio::time::sleep(self.size_delay).await;
        Ok(Some(4096))
    }

    async fn binlog_format(&self) -> anyhow::Result<String> {
        Ok(self.binlog_format.lock().unwrap().clone())
    }

    async fn optimize(&self, database: &str) -> Result<(), UnitError> {
        if self.optimize_failing.lock().unwrap().contains(database) {
            return Err(UnitError::Optimize("Table is read only".into()));
        }
        Ok(())
    }

    async fn dump_full(
        &self,
        target: &DumpTarget,
        _progress: Box<dyn ProgressSource>,
        report: watch::Sender<i64>,
    ) -> Result<DumpOutcome, UnitError> {
        self.dump(target, report).await
    }

    async fn dump_incremental(
        &self,
        target: &DumpTarget,
        window: Window,
        _progress: Box<dyn ProgressSource>,
        report: watch::Sender<i64>,
    ) -> Result<DumpOutcome, UnitError> {
        self.windows.lock().unwrap().push((target.database.clone(), window));
        self.dump(target, report).await
    }

    async fn ping(&self) -> bool {
        true
    }
}

// ── Notifications ──

#[derive(Default)]
pub struct RecordingNotifier {
    summaries: Mutex<Vec<Summary>>,
}

impl RecordingNotifier {
    pub fn summaries(&self) -> Vec<Summary> {
        self.summaries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SummaryNotifier for RecordingNotifier {
    async fn notify(&self, summary: &Summary) -> anyhow::Result<()> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}
