//! Bounded-parallel execution of backup units.
//!
//! A cohort's databases are pre-loaded into a closed queue and pulled by
//! `parallelism` workers. Per unit a worker checks abort, passes admission
//! control, takes a slot, re-checks abort, then runs the unit and accounts
//! its outcome into the request totals before releasing the slot.

use crate::error::UnitError;
use crate::models::job::{JobStatus, NewJob, StatusUpdate, UnitType};
use crate::models::summary::Totals;
use crate::services::admission::AdmissionController;
use crate::services::chain::{self, ArtifactKind};
use crate::services::context::RunContext;
use crate::services::mode::Cohort;
use crate::services::progress::{LineCountProgress, TableCountProgress};
use crate::services::tools::{DatabaseTools, DumpOutcome, DumpTarget, Window};
use crate::store::Store;
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinSet;

/// Lines of binlog output per progress point.
const BINLOG_LINES_PER_POINT: u64 = 500;

/// Everything a worker needs besides the request context.
pub struct UnitRunner {
    pub store: Store,
    pub tools: Arc<dyn DatabaseTools>,
    pub admission: Arc<AdmissionController>,
    pub backup_dir: PathBuf,
    pub compress: bool,
    pub optimize_tables: bool,
}

enum Admission {
    Granted(OwnedSemaphorePermit),
    Aborted,
    RestartFailed(UnitError),
}

enum Finished {
    Done {
        unit_type: UnitType,
        outcome: DumpOutcome,
        output: PathBuf,
        note: Option<String>,
    },
    Failed(String),
    Cancelled,
}

fn with_note(note: Option<String>, err: &UnitError) -> String {
    match note {
        Some(note) => format!("{note}; {err}"),
        None => err.to_string(),
    }
}

/// Process every database of `cohort` at most once, `ctx.parallelism()` at a
/// time. Returns when all workers have exited.
pub async fn run_cohort(runner: Arc<UnitRunner>, ctx: Arc<RunContext>, cohort: Cohort) {
    let (tx, rx) = mpsc::channel(cohort.databases.len().max(1));
    for database in cohort.databases {
        // Capacity equals the number of databases
        let _ = tx.try_send(database);
    }
    drop(tx);
    let queue = Arc::new(Mutex::new(rx));

    let mut workers = JoinSet::new();
    for worker in 0..ctx.parallelism() {
        workers.spawn(worker_loop(
            worker,
            runner.clone(),
            ctx.clone(),
            queue.clone(),
            cohort.unit_type,
        ));
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(group_id = %ctx.job_group_id(), error = %e, "Backup worker panicked");
        }
    }
}

async fn worker_loop(
    worker: usize,
    runner: Arc<UnitRunner>,
    ctx: Arc<RunContext>,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    unit_type: UnitType,
) {
    loop {
        if ctx.is_aborted() {
            tracing::debug!(worker, group_id = %ctx.job_group_id(), "Abort observed, worker exiting");
            return;
        }
        let Some(database) = queue.lock().await.recv().await else {
            return;
        };
        runner.process(&ctx, &database, unit_type).await;
    }
}

impl UnitRunner {
    async fn process(&self, ctx: &RunContext, database: &str, requested: UnitType) {
        let permit = match self.admit(ctx).await {
            Admission::Granted(permit) => permit,
            Admission::Aborted => {
                tracing::info!(group_id = %ctx.job_group_id(), database = %database, "Skipping unit: request aborted");
                return;
            }
            Admission::RestartFailed(err) => {
                self.fail_unstarted(ctx, database, requested, &err).await;
                return;
            }
        };

        // Incrementals need a prior artifact; without one the unit runs full
        let resolved = if requested.is_full() {
            Ok((requested, None))
        } else {
            match chain::next_incremental_start(&self.backup_dir, database).await {
                Ok(Some(start)) => Ok((requested, Some(start))),
                Ok(None) => {
                    tracing::info!(database = %database, "No prior backup, running a full backup instead");
                    Ok((requested.as_full(), None))
                }
                Err(e) => Err(UnitError::Write(format!("cannot read backup chain: {e}"))),
            }
        };
        let (unit_type, window_start) = match resolved {
            Ok(r) => r,
            Err(err) => {
                self.fail_unstarted(ctx, database, requested, &err).await;
                return;
            }
        };

        let optimizing = self.optimize_tables && unit_type.is_full();
        let estimated_size = self.tools.database_size(database).await.ok().flatten();

        // Nothing awaits between this check and the running row
        if ctx.is_aborted() {
            tracing::info!(group_id = %ctx.job_group_id(), database = %database, "Skipping unit: request aborted");
            return;
        }
        let started = self
            .store
            .start_job(NewJob {
                job_group_id: ctx.job_group_id().to_string(),
                database_name: database.to_string(),
                unit_type,
                status: if optimizing { JobStatus::Optimizing } else { JobStatus::Running },
                estimated_size,
            })
            .await;
        if let Err(e) = started {
            tracing::error!(group_id = %ctx.job_group_id(), database = %database, error = %e, "Cannot record unit start");
            self.account(ctx, |t| t.failed += 1).await;
            return;
        }
        tracing::info!(group_id = %ctx.job_group_id(), database = %database, unit_type = %unit_type, "Unit started");

        let finished = self.execute(ctx, database, unit_type, window_start, optimizing).await;
        self.finish(ctx, database, finished).await;
        drop(permit);
    }

    /// Steps (a) to (d) of a unit: abort, admission, slot, abort again.
    async fn admit(&self, ctx: &RunContext) -> Admission {
        loop {
            if ctx.is_aborted() {
                return Admission::Aborted;
            }
            if let Err(err) = self.clear_memory(ctx).await {
                return Admission::RestartFailed(err);
            }
            let generation = ctx.restart_generation();

            let Some(permit) = ctx.acquire_slot().await else {
                return Admission::Aborted;
            };
            if ctx.is_aborted() {
                return Admission::Aborted;
            }
            // A restart began or ran while we queued for the slot: check memory again
            if ctx.restart_in_progress() || ctx.restart_generation() != generation {
                drop(permit);
                continue;
            }
            return Admission::Granted(permit);
        }
    }

    /// Return once memory is under threshold. The first worker over the
    /// threshold coordinates a restart; the others wait for it.
    async fn clear_memory(&self, ctx: &RunContext) -> Result<(), UnitError> {
        loop {
            if ctx.is_aborted() {
                return Ok(());
            }
            if ctx.restart_in_progress() {
                tokio::time::sleep(self.admission.wait_interval()).await;
                continue;
            }
            if !self.admission.over_threshold() {
                return Ok(());
            }
            if !ctx.try_begin_restart() {
                continue;
            }

            tracing::warn!(group_id = %ctx.job_group_id(), in_flight = ctx.in_flight(), "Pausing new units, draining for service restart");
            let outcome = match ctx.drain().await {
                Some(_all_slots) => self.admission.restart_and_wait().await.map(Some),
                None => Ok(None),
            };
            ctx.end_restart();

            match outcome {
                Ok(Some(elapsed)) => {
                    // Rounded up so short restarts still show in the summary
                    let seconds = elapsed.as_secs_f64().ceil() as i64;
                    if let Err(e) = self.store.add_restart_seconds(ctx.job_group_id(), seconds).await {
                        tracing::error!(group_id = %ctx.job_group_id(), error = %e, "Cannot record restart time");
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    tracing::error!(group_id = %ctx.job_group_id(), error = %err, "Aborting request");
                    ctx.abort();
                    return Err(err);
                }
            }
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        database: &str,
        unit_type: UnitType,
        window_start: Option<NaiveDateTime>,
        optimizing: bool,
    ) -> Finished {
        let group = ctx.job_group_id();
        let mut note = None;

        if optimizing {
            if ctx.is_aborted() {
                return Finished::Cancelled;
            }
            if let Err(err) = self.tools.optimize(database).await {
                tracing::warn!(group_id = %group, database = %database, error = %err, "Optimization failed, dumping anyway");
                note = Some(err.to_string());
            }
            self.store.push_status(StatusUpdate::new(group, database, JobStatus::Running)).await;
        }

        if ctx.is_aborted() {
            return Finished::Cancelled;
        }

        let dir = chain::database_dir(&self.backup_dir, database);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Finished::Failed(with_note(note, &UnitError::Write(format!("{}: {e}", dir.display()))));
        }

        let stamp = chrono::Local::now().naive_local();
        let kind = if unit_type.is_full() { ArtifactKind::Full } else { ArtifactKind::Incremental };
        let output = dir.join(chain::artifact_name(kind, database, stamp, self.compress));
        let target = DumpTarget {
            database: database.to_string(),
            output: output.clone(),
            compress: self.compress,
        };

        let (report, progress_rx) = watch::channel(0);
        let dump = async {
            match window_start {
                Some(start) => {
                    let window = Window { start, stop: stamp };
                    self.tools
                        .dump_incremental(&target, window, Box::new(LineCountProgress::new(BINLOG_LINES_PER_POINT)), report)
                        .await
                }
                None => {
                    let tables = self.tools.table_count(database).await.unwrap_or_else(|e| {
                        tracing::debug!(database = %database, error = %e, "Table count unavailable");
                        0
                    });
                    self.tools
                        .dump_full(&target, Box::new(TableCountProgress::new(tables)), report)
                        .await
                }
            }
        };
        let (result, ()) = tokio::join!(dump, self.forward_progress(group, database, progress_rx));

        match result {
            Ok(outcome) => Finished::Done {
                unit_type,
                outcome,
                output,
                note,
            },
            Err(err) => {
                // A partial artifact must not become the chain's latest point
                if let Err(e) = tokio::fs::remove_file(&output).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %output.display(), error = %e, "Cannot remove partial artifact");
                    }
                }
                Finished::Failed(with_note(note, &err))
            }
        }
    }

    async fn forward_progress(&self, group: &str, database: &str, mut rx: watch::Receiver<i64>) {
        while rx.changed().await.is_ok() {
            let pct = *rx.borrow_and_update();
            self.store.push_progress(group, database, pct).await;
        }
    }

    async fn finish(&self, ctx: &RunContext, database: &str, finished: Finished) {
        let group = ctx.job_group_id();
        match finished {
            Finished::Done {
                unit_type,
                outcome,
                output,
                note,
            } => {
                tracing::info!(
                    group_id = %group,
                    database = %database,
                    bytes = outcome.bytes,
                    disk_bytes = outcome.disk_bytes,
                    "Unit done"
                );
                let mut update = StatusUpdate::new(group, database, JobStatus::Done);
                update.progress = Some(100);
                update.actual_size = Some(outcome.bytes as i64);
                update.output_path = Some(output.to_string_lossy().to_string());
                update.error = note;
                self.store.push_status(update).await;
                self.account(ctx, |t| {
                    if unit_type.is_full() {
                        t.full += 1;
                    } else {
                        t.incremental += 1;
                    }
                    t.bytes += outcome.bytes as i64;
                    t.disk_bytes += outcome.disk_bytes as i64;
                })
                .await;
            }
            Finished::Failed(error) => {
                tracing::error!(group_id = %group, database = %database, error = %error, "Unit failed");
                let mut update = StatusUpdate::new(group, database, JobStatus::Failed);
                update.error = Some(error);
                self.store.push_status(update).await;
                self.account(ctx, |t| t.failed += 1).await;
            }
            Finished::Cancelled => {
                tracing::info!(group_id = %group, database = %database, "Unit cancelled");
                self.store
                    .push_status(StatusUpdate::new(group, database, JobStatus::Cancelled))
                    .await;
            }
        }
    }

    /// Record a unit that failed before it could run.
    async fn fail_unstarted(&self, ctx: &RunContext, database: &str, unit_type: UnitType, err: &UnitError) {
        let group = ctx.job_group_id();
        tracing::error!(group_id = %group, database = %database, error = %err, "Unit failed before start");
        let started = self
            .store
            .start_job(NewJob {
                job_group_id: group.to_string(),
                database_name: database.to_string(),
                unit_type,
                status: JobStatus::Running,
                estimated_size: None,
            })
            .await;
        if started.is_ok() {
            let mut update = StatusUpdate::new(group, database, JobStatus::Failed);
            update.error = Some(err.to_string());
            self.store.push_status(update).await;
        }
        self.account(ctx, |t| t.failed += 1).await;
    }

    /// Apply `change` to the request totals and persist the new snapshot
    /// under the same lock.
    async fn account(&self, ctx: &RunContext, change: impl FnOnce(&mut Totals)) {
        let mut totals = ctx.totals().await;
        change(&mut totals);
        if let Err(e) = self.store.set_totals(ctx.job_group_id(), *totals).await {
            tracing::error!(group_id = %ctx.job_group_id(), error = %e, "Cannot persist request totals");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::summary::BackupMode;
    use crate::testing::{self, FakeSampler, FakeService, FakeTools};
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Store,
        tools: Arc<FakeTools>,
        sampler: Arc<FakeSampler>,
        service: Arc<FakeService>,
        runner: Arc<UnitRunner>,
    }

    async fn harness(tools: FakeTools, service: FakeService) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = testing::store(dir.path());
        let tools = Arc::new(tools);
        let sampler = Arc::new(FakeSampler::new(40.0));
        let service = Arc::new(service);
        let admission = Arc::new(AdmissionController::new(
            sampler.clone(),
            service.clone(),
            90.0,
            Duration::from_millis(10),
            Duration::from_millis(200),
            Duration::from_millis(5),
        ));
        let runner = Arc::new(UnitRunner {
            store: store.clone(),
            tools: tools.clone(),
            admission,
            backup_dir: dir.path().join("backups"),
            compress: true,
            optimize_tables: false,
        });
        Harness {
            _dir: dir,
            store,
            tools,
            sampler,
            service,
            runner,
        }
    }

    fn cohort(unit_type: UnitType, dbs: &[&str]) -> Cohort {
        Cohort {
            unit_type,
            databases: dbs.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn run(h: &Harness, group: &str, parallelism: usize, c: Cohort) -> Arc<RunContext> {
        h.store
            .create_summary(group, c.databases.len() as i64, BackupMode::Full)
            .await
            .unwrap();
        let ctx = Arc::new(RunContext::new(group, parallelism, Totals::default()));
        run_cohort(h.runner.clone(), ctx.clone(), c).await;
        h.store.flush().await;
        ctx
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_parallelism() {
        let h = harness(FakeTools::new(&[]).with_delay(Duration::from_millis(30)), FakeService::healthy()).await;
        run(&h, "g1", 2, cohort(UnitType::ForcedFull, &["a", "b", "c", "d", "e", "f"])).await;

        assert_eq!(h.tools.max_in_flight(), 2);
        assert_eq!(h.tools.dumped().len(), 6);
    }

    #[tokio::test]
    async fn three_databases_two_slots_all_full() {
        let h = harness(FakeTools::new(&[]).with_delay(Duration::from_millis(5)), FakeService::healthy()).await;
        run(&h, "g1", 2, cohort(UnitType::ForcedFull, &["a", "b", "c"])).await;

        let jobs = h.store.jobs_for_group("g1").await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Done && j.progress == 100));
        assert!(jobs.iter().all(|j| j.output_path.as_deref().is_some_and(|p| p.ends_with(".sql.gz"))));

        let summary = h.store.summary("g1").await.unwrap().unwrap();
        assert_eq!(summary.total_full, 3);
        assert_eq!(summary.total_failed, 0);
        assert!(summary.total_bytes > 0);
    }

    #[tokio::test]
    async fn failed_unit_does_not_stop_siblings() {
        let tools = FakeTools::new(&[]).with_delay(Duration::from_millis(5));
        tools.fail("b");
        let h = harness(tools, FakeService::healthy()).await;
        run(&h, "g1", 2, cohort(UnitType::ForcedFull, &["a", "b", "c"])).await;

        let summary = h.store.summary("g1").await.unwrap().unwrap();
        assert_eq!(summary.total_full, 2);
        assert_eq!(summary.total_failed, 1);

        let b = h.store.job("g1", "b").await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        assert!(b.error.unwrap().starts_with("dump failed"));
        // The partial artifact was removed
        let chain = chain::scan(&h.runner.backup_dir, "b").await.unwrap();
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn optimization_error_is_kept_as_note() {
        let tools = FakeTools::new(&[]);
        tools.fail_optimize("a");
        tools.fail("b");
        tools.fail_optimize("b");
        let mut h = harness(tools, FakeService::healthy()).await;
        Arc::get_mut(&mut h.runner).unwrap().optimize_tables = true;
        run(&h, "g1", 1, cohort(UnitType::ForcedFull, &["a", "b"])).await;

        let a = h.store.job("g1", "a").await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Done);
        assert!(a.error.unwrap().starts_with("optimize failed"));

        let b = h.store.job("g1", "b").await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        let error = b.error.unwrap();
        assert!(error.starts_with("optimize failed"));
        assert!(error.contains("; dump failed"));
    }

    #[tokio::test]
    async fn incremental_without_prior_backup_runs_full() {
        let h = harness(FakeTools::new(&[]), FakeService::healthy()).await;
        run(&h, "g1", 1, cohort(UnitType::AutoIncremental, &["a"])).await;

        let a = h.store.job("g1", "a").await.unwrap().unwrap();
        assert_eq!(a.unit_type, UnitType::AutoFull);
        assert!(h.tools.windows().is_empty());

        // The full just written anchors the next incremental
        run(&h, "g2", 1, cohort(UnitType::AutoIncremental, &["a"])).await;
        let a = h.store.job("g2", "a").await.unwrap().unwrap();
        assert_eq!(a.unit_type, UnitType::AutoIncremental);
        let windows = h.tools.windows();
        assert_eq!(windows.len(), 1);
        assert!(windows[0].1.start <= windows[0].1.stop);

        let summary = h.store.summary("g2").await.unwrap().unwrap();
        assert_eq!(summary.total_incremental, 1);
    }

    #[tokio::test]
    async fn memory_pressure_drains_before_third_unit() {
        let h = harness(
            FakeTools::new(&[]).with_delay(Duration::from_millis(50)),
            FakeService::healthy(),
        )
        .await;
        // First two checks pass, everything after is over threshold until the restart
        h.sampler.script(&[40.0, 40.0]);
        h.sampler.set(95.0);
        h.service.recover_sampler(h.sampler.clone(), 40.0);

        run(&h, "g1", 2, cohort(UnitType::ForcedFull, &["a", "b", "c"])).await;

        assert_eq!(h.service.restarts(), 1);
        let events = h.tools.events();
        let start_c = events.iter().position(|e| e == "start:c").unwrap();
        let end_a = events.iter().position(|e| e == "end:a").unwrap();
        let end_b = events.iter().position(|e| e == "end:b").unwrap();
        assert!(start_c > end_a && start_c > end_b);
        assert!(h.tools.max_in_flight() <= 2);

        let summary = h.store.summary("g1").await.unwrap().unwrap();
        assert_eq!(summary.total_full, 3);
    }

    #[tokio::test]
    async fn restarts_run_one_after_another() {
        let h = harness(FakeTools::new(&[]), FakeService::healthy()).await;
        // Each unit finds memory high once, then clear after its restart
        h.sampler.script(&[95.0, 40.0, 95.0, 40.0]);

        run(&h, "g1", 1, cohort(UnitType::ForcedFull, &["a", "b"])).await;

        assert_eq!(h.service.restarts(), 2);
        let summary = h.store.summary("g1").await.unwrap().unwrap();
        assert_eq!(summary.total_full, 2);
        assert!(summary.restart_seconds >= 2);
    }

    #[tokio::test]
    async fn abort_during_size_query_never_starts_the_unit() {
        let h = harness(
            FakeTools::new(&[]).with_size_delay(Duration::from_millis(150)),
            FakeService::healthy(),
        )
        .await;
        h.store.create_summary("g1", 1, BackupMode::Full).await.unwrap();
        let mut events = h.store.notifier().subscribe();
        let ctx = Arc::new(RunContext::new("g1", 1, Totals::default()));

        let pool = tokio::spawn(run_cohort(h.runner.clone(), ctx.clone(), cohort(UnitType::ForcedFull, &["a"])));
        tokio::time::sleep(Duration::from_millis(30)).await;
        ctx.abort();
        pool.await.unwrap();
        h.store.flush().await;

        assert!(h.tools.dumped().is_empty());
        assert!(h.store.jobs_for_group("g1").await.unwrap().is_empty());
        while let Ok(event) = events.try_recv() {
            assert!(!event.contains("job:status"), "unit changed status: {event}");
        }
    }

    #[tokio::test]
    async fn failed_restart_aborts_the_request() {
        let h = harness(
            FakeTools::new(&[]).with_delay(Duration::from_millis(5)),
            FakeService::never_alive(),
        )
        .await;
        h.sampler.set(99.0);

        let ctx = run(&h, "g1", 2, cohort(UnitType::ForcedFull, &["a", "b", "c"])).await;

        assert!(ctx.is_aborted());
        assert!(h.tools.dumped().is_empty());
        let jobs = h.store.jobs_for_group("g1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error.as_deref().unwrap().starts_with("service restart failed"));

        let summary = h.store.summary("g1").await.unwrap().unwrap();
        assert_eq!(summary.total_failed, 1);
    }

    #[tokio::test]
    async fn abort_stops_new_units() {
        let h = harness(FakeTools::new(&[]).with_delay(Duration::from_millis(80)), FakeService::healthy()).await;
        h.store.create_summary("g1", 3, BackupMode::Full).await.unwrap();
        let ctx = Arc::new(RunContext::new("g1", 1, Totals::default()));

        let pool = tokio::spawn(run_cohort(
            h.runner.clone(),
            ctx.clone(),
            cohort(UnitType::ForcedFull, &["a", "b", "c"]),
        ));
        h.tools.wait_started("a").await;
        ctx.abort();
        pool.await.unwrap();
        h.store.flush().await;

        assert_eq!(h.tools.dumped(), vec!["a".to_string()]);
        let jobs = h.store.jobs_for_group("g1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].database_name, "a");
    }
}
