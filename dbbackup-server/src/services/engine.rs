//! Request-level entry points: accept a request, plan it, run its cohorts
//! through the worker pool in the background and finalize its summary.

use crate::error::{EngineError, Result};
use crate::models::job::{DatabaseHistory, Job, TimelineDay};
use crate::models::summary::{BackupMode, Page, Summary, SummaryState, Totals};
use crate::services::chain::{self, Chain};
use crate::services::context::RunContext;
use crate::services::mode::{self, Plan};
use crate::services::retention::{self, RetentionReport};
use crate::services::scheduler::{ScheduledWork, SchedulerStatus};
use crate::services::tools::SYSTEM_DATABASES;
use crate::services::worker_pool;
use crate::state::AppState;
use async_trait::async_trait;
use chrono::{Local, Utc};
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub active_jobs: Vec<Job>,
    pub recent: Vec<Summary>,
}

#[derive(Clone)]
pub struct BackupEngine {
    state: Arc<AppState>,
}

impl BackupEngine {
    pub fn new(state: AppState) -> Self {
        Self { state: Arc::new(state) }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    // ── Requests ──

    /// Full backup of `databases`, or of every user database when empty.
    /// Returns the job group id as soon as the request is accepted.
    pub async fn start_full(&self, databases: Vec<String>) -> Result<String> {
        self.start(BackupMode::Full, databases).await
    }

    pub async fn start_incremental(&self, databases: Vec<String>) -> Result<String> {
        self.start(BackupMode::Incremental, databases).await
    }

    pub async fn start_auto(&self, databases: Vec<String>) -> Result<String> {
        self.start(BackupMode::Auto, databases).await
    }

    pub async fn start(&self, mode: BackupMode, databases: Vec<String>) -> Result<String> {
        self.state.tools.preflight().await?;
        let databases = self.select_databases(databases).await?;

        let group = uuid::Uuid::new_v4().to_string();
        self.claim(&group, &databases)?;
        match self.plan_and_record(&group, mode, &databases).await {
            Ok(plan) => {
                tracing::info!(group_id = %group, mode = %mode, databases = plan.database_count(), "Backup request accepted");
                self.launch(group.clone(), plan, Totals::default());
                Ok(group)
            }
            Err(e) => {
                self.release(&group);
                Err(e)
            }
        }
    }

    async fn plan_and_record(&self, group: &str, mode: BackupMode, databases: &[String]) -> Result<Plan> {
        let config = &self.state.config;
        let mut plan = mode::resolve(
            mode,
            databases,
            &config.backup.backup_dir,
            chrono::Duration::days(config.schedule.full_interval_days),
            Local::now().naive_local(),
        )
        .await;
        self.check_binlog(&mut plan).await;

        self.state
            .store
            .create_summary(group, plan.database_count() as i64, mode)
            .await?;
        Ok(plan)
    }

    /// Re-run the failed units of a completed request under the same job
    /// group. Totals of the units that already succeeded are kept.
    pub async fn retry(&self, job_group_id: &str) -> Result<()> {
        if self.state.runs.contains_key(job_group_id) {
            return Err(EngineError::Conflict(format!("Job group {job_group_id} is still running")));
        }
        self.state.tools.preflight().await?;

        // Claim before resetting anything so a rejected retry leaves the group untouched
        let pending: Vec<String> = self
            .state
            .store
            .failed_units(job_group_id)
            .await?
            .into_iter()
            .map(|(db, _)| db)
            .collect();
        self.claim(job_group_id, &pending)?;

        let (summary, failed) = match self.state.store.prepare_retry(job_group_id).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(job_group_id);
                return Err(e);
            }
        };
        let mut plan = Plan::from_units(failed);
        self.check_binlog(&mut plan).await;

        tracing::info!(group_id = %job_group_id, databases = plan.database_count(), "Retrying failed units");
        self.launch(job_group_id.to_string(), plan, Totals::from_summary(&summary));
        Ok(())
    }

    /// Abort every running request and cancel whatever is still marked active.
    pub async fn stop(&self) -> Result<usize> {
        for run in self.state.runs.iter() {
            run.value().abort();
        }
        let cancelled = self.state.store.cancel_active(None).await?;

        // Requests with live workers finalize themselves; anything else still
        // marked running has no owner left
        for summary in self.state.store.running_summaries().await? {
            if !self.state.runs.contains_key(&summary.job_group_id) {
                self.state
                    .store
                    .finalize_summary(&summary.job_group_id, SummaryState::Cancelled)
                    .await?;
            }
        }
        tracing::warn!(cancelled, "All backup requests stopped");
        Ok(cancelled)
    }

    /// Wait until the request has been finalized and return its summary.
    pub async fn wait(&self, job_group_id: &str) -> Result<Summary> {
        let run = self.state.runs.get(job_group_id).map(|r| r.value().clone());
        if let Some(run) = run {
            run.wait_finished().await;
        }
        self.summary(job_group_id).await
    }

    /// Group ids of requests with live workers.
    pub fn running(&self) -> Vec<String> {
        self.state.runs.iter().map(|r| r.key().clone()).collect()
    }

    async fn select_databases(&self, requested: Vec<String>) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let named: Vec<String> = requested
            .into_iter()
            .map(|db| db.trim().to_string())
            .filter(|db| !db.is_empty() && seen.insert(db.clone()))
            .collect();
        if !named.is_empty() {
            return Ok(named);
        }

        let excluded = &self.state.config.backup.exclude_databases;
        let all = self
            .state
            .tools
            .list_databases()
            .await
            .map_err(|e| EngineError::Config(format!("Cannot list databases: {e}")))?;
        let selected: Vec<String> = all
            .into_iter()
            .filter(|db| !SYSTEM_DATABASES.contains(&db.as_str()) && !excluded.contains(db))
            .collect();
        if selected.is_empty() {
            return Err(EngineError::BadRequest("No databases to back up".into()));
        }
        Ok(selected)
    }

    /// Incrementals replay the binary log, which only carries row images in
    /// ROW format. Anything else turns the incremental cohorts into fulls.
    async fn check_binlog(&self, plan: &mut Plan) {
        if !plan.has_incrementals() {
            return;
        }
        match self.state.tools.binlog_format().await {
            Ok(format) if format.eq_ignore_ascii_case("ROW") => {}
            Ok(format) => {
                tracing::warn!(binlog_format = %format, "Binary log format is not ROW, running full backups instead");
                plan.force_full();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read binary log format, running full backups instead");
                plan.force_full();
            }
        }
    }

    /// Mark `databases` as owned by `group`. Claims nothing when another
    /// request already holds one of them, so two chains never grow at once.
    fn claim(&self, group: &str, databases: &[String]) -> Result<()> {
        let mut claimed = Vec::new();
        for db in databases {
            let holder = match self.state.claims.entry(db.clone()) {
                Entry::Occupied(e) => Some(e.get().clone()),
                Entry::Vacant(e) => {
                    e.insert(group.to_string());
                    None
                }
            };
            if let Some(holder) = holder {
                for db in &claimed {
                    self.state.claims.remove(db);
                }
                return Err(EngineError::Conflict(format!(
                    "Database {db} is already being backed up by job group {holder}"
                )));
            }
            claimed.push(db.clone());
        }
        Ok(())
    }

    fn release(&self, group: &str) {
        self.state.claims.retain(|_, holder| holder != group);
    }

    fn launch(&self, group: String, plan: Plan, seed: Totals) {
        let ctx = Arc::new(RunContext::new(group.clone(), self.state.config.backup.parallelism, seed));
        self.state.runs.insert(group, ctx.clone());
        let engine = self.clone();
        tokio::spawn(async move { engine.run(ctx, plan).await });
    }

    async fn run(&self, ctx: Arc<RunContext>, plan: Plan) {
        let group = ctx.job_group_id().to_string();
        for cohort in plan.cohorts {
            if ctx.is_aborted() {
                break;
            }
            tracing::debug!(group_id = %group, unit_type = %cohort.unit_type, databases = cohort.databases.len(), "Running cohort");
            worker_pool::run_cohort(self.state.runner.clone(), ctx.clone(), cohort).await;
        }

        tokio::time::sleep(self.state.config.store.completion_grace()).await;
        self.state.store.flush().await;

        let outcome = if ctx.is_aborted() {
            // Retried units that never got a worker are still marked running
            if let Err(e) = self.state.store.cancel_active(Some(&group)).await {
                tracing::error!(group_id = %group, error = %e, "Cannot cancel leftover units");
            }
            SummaryState::Cancelled
        } else {
            SummaryState::Completed
        };

        match self.state.store.finalize_summary(&group, outcome).await {
            Ok(summary) => {
                if let Err(e) = self.state.notifier.notify(&summary).await {
                    tracing::warn!(group_id = %group, error = %e, "Summary notification failed");
                }
            }
            Err(e) => tracing::error!(group_id = %group, error = %e, "Cannot finalize summary"),
        }

        self.release(&group);
        self.state.runs.remove(&group);
        ctx.mark_finished();
    }

    // ── Scheduler ──

    pub async fn start_scheduler(&self) -> Result<bool> {
        self.state.scheduler.start(Arc::new(self.clone())).await
    }

    pub async fn stop_scheduler(&self) {
        self.state.scheduler.stop().await;
    }

    pub async fn scheduler_status(&self) -> SchedulerStatus {
        self.state.scheduler.status().await
    }

    // ── Maintenance ──

    pub async fn cleanup_retention(&self) -> Result<RetentionReport> {
        let report = retention::cleanup(
            &self.state.config.backup.backup_dir,
            self.state.config.retention.retention_days,
            Local::now().naive_local(),
        )
        .await?;
        tracing::info!(
            chains = report.chains_removed,
            files = report.files_removed,
            bytes = report.bytes_removed,
            "Retention cleanup finished"
        );
        Ok(report)
    }

    /// Close out jobs and summaries a previous process left running.
    pub async fn recover_interrupted(&self) -> Result<()> {
        let (jobs, summaries) = self.state.store.recover_interrupted().await?;
        if jobs > 0 || summaries > 0 {
            tracing::warn!(jobs, summaries, "Marked interrupted work as cancelled");
        }
        Ok(())
    }

    // ── Reads ──

    pub async fn summary(&self, job_group_id: &str) -> Result<Summary> {
        self.state
            .store
            .summary(job_group_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Job group {job_group_id} not found")))
    }

    /// Active units and the most recent requests, as recorded in the store.
    pub async fn snapshot(&self, recent: i64) -> Result<StoreSnapshot> {
        Ok(StoreSnapshot {
            active_jobs: self.state.store.active_jobs().await?,
            recent: self.state.store.history(1, recent).await?.items,
        })
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>> {
        self.state.store.active_jobs().await
    }

    pub async fn jobs_for_group(&self, job_group_id: &str) -> Result<Vec<Job>> {
        self.state.store.jobs_for_group(job_group_id).await
    }

    pub async fn history(&self, page: i64, per_page: i64) -> Result<Page<Summary>> {
        self.state.store.history(page, per_page).await
    }

    pub async fn database_history(&self, database: &str, limit: i64) -> Result<Vec<Job>> {
        self.state.store.database_history(database, limit).await
    }

    pub async fn grouped_history(&self, per_database: i64) -> Result<Vec<DatabaseHistory>> {
        self.state.store.grouped_history(per_database).await
    }

    /// Per-day totals over the last `days` days.
    pub async fn timeline(&self, days: i64) -> Result<Vec<TimelineDay>> {
        let since = Utc::now() - chrono::Duration::days(days.max(1));
        self.state.store.timeline(since).await
    }

    pub async fn chains(&self, database: &str) -> Result<Vec<Chain>> {
        let artifacts = chain::scan(&self.state.config.backup.backup_dir, database).await?;
        Ok(chain::group_chains(artifacts))
    }

    /// Live change events as JSON text.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.state.store.notifier().subscribe()
    }
}

#[async_trait]
impl ScheduledWork for BackupEngine {
    async fn run_scheduled(&self, mode: BackupMode) -> Result<String> {
        self.start(mode, Vec::new()).await
    }

    async fn cleanup(&self) {
        if let Err(e) = self.cleanup_retention().await {
            tracing::error!(error = %e, "Retention cleanup failed");
        }
    }
}
