//! Durable job/summary store.
//!
//! Every write goes through the retry policy; progress and status updates go
//! through coalescing batchers. Successful writes are announced on the
//! [`ChangeNotifier`].

pub mod batcher;

use crate::config::StoreConfig;
use crate::db::connection::DbPool;
use crate::db::retry::RetryPolicy;
use crate::error::{EngineError, Result};
use crate::models::job::{self, DatabaseHistory, Job, NewJob, ProgressUpdate, StatusUpdate, TimelineDay, UnitType};
use crate::models::summary::{self, BackupMode, Page, Summary, SummaryState, Totals};
use crate::notify::ChangeNotifier;
use batcher::{BatchOptions, WriteBatcher, Writer};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    policy: RetryPolicy,
    notifier: ChangeNotifier,
    progress: Arc<WriteBatcher<ProgressUpdate>>,
    status: Arc<WriteBatcher<StatusUpdate>>,
}

fn progress_event(u: &ProgressUpdate) -> serde_json::Value {
    serde_json::json!({
        "jobGroupId": u.job_group_id,
        "database": u.database_name,
        "progress": u.progress,
    })
}

fn status_event(u: &StatusUpdate) -> serde_json::Value {
    serde_json::json!({
        "jobGroupId": u.job_group_id,
        "database": u.database_name,
        "status": u.status,
        "progress": u.progress,
        "actualSize": u.actual_size,
        "error": u.error,
    })
}

fn summary_event(s: &Summary) -> serde_json::Value {
    serde_json::json!({
        "jobGroupId": s.job_group_id,
        "state": s.state,
        "requested": s.requested_count,
        "totalFull": s.total_full,
        "totalIncremental": s.total_incremental,
        "totalFailed": s.total_failed,
        "totalBytes": s.total_bytes,
        "restartSeconds": s.restart_seconds,
    })
}

impl Store {
    /// Build the store and start its flush loops. Must be called inside a
    /// tokio runtime.
    pub fn new(pool: DbPool, config: &StoreConfig, notifier: ChangeNotifier) -> Self {
        let policy = RetryPolicy::from_config(config);
        let options = BatchOptions {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            queue_capacity: config.queue_capacity,
        };

        let ui = notifier.clone();
        let (progress, _) = WriteBatcher::spawn(
            Writer {
                pool: pool.clone(),
                policy: policy.clone(),
                apply: Arc::new(|conn: &Connection, u: &ProgressUpdate| job::update_progress(conn, u)),
                on_written: Arc::new(move |u: &ProgressUpdate| ui.broadcast("job:progress", progress_event(u))),
                label: "job_progress",
            },
            options,
        );

        let ui = notifier.clone();
        let (status, _) = WriteBatcher::spawn(
            Writer {
                pool: pool.clone(),
                policy: policy.clone(),
                apply: Arc::new(|conn: &Connection, u: &StatusUpdate| job::update_status(conn, u)),
                on_written: Arc::new(move |u: &StatusUpdate| ui.broadcast("job:status", status_event(u))),
                label: "job_status",
            },
            options,
        );

        Self {
            pool,
            policy,
            notifier,
            progress: Arc::new(progress),
            status: Arc::new(status),
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    // ── Batched writes ──

    pub async fn push_progress(&self, job_group_id: &str, database_name: &str, progress: i64) {
        self.progress
            .push(ProgressUpdate {
                job_group_id: job_group_id.to_string(),
                database_name: database_name.to_string(),
                progress,
                seq: job::next_seq(),
            })
            .await;
    }

    pub async fn push_status(&self, update: StatusUpdate) {
        self.status.push(update).await;
    }

    /// Wait until every queued progress and status update is written.
    pub async fn flush(&self) {
        self.progress.flush().await;
        self.status.flush().await;
    }

    // ── Direct writes ──

    pub async fn create_summary(&self, job_group_id: &str, requested_count: i64, mode: BackupMode) -> Result<Summary> {
        let group = job_group_id.to_string();
        let created = self
            .policy
            .run_db(&self.pool, "create_summary", move |conn| {
                summary::create(conn, &group, requested_count, mode)
            })
            .await?;
        self.notifier.broadcast("summary:updated", summary_event(&created));
        Ok(created)
    }

    pub async fn start_job(&self, data: NewJob) -> Result<Job> {
        let started = self
            .policy
            .run_db(&self.pool, "start_job", move |conn| job::start(conn, &data))
            .await?;
        self.notifier.broadcast("job:status", serde_json::json!({
            "jobGroupId": started.job_group_id,
            "database": started.database_name,
            "status": started.status,
            "unitType": started.unit_type,
            "progress": 0,
        }));
        Ok(started)
    }

    pub async fn set_totals(&self, job_group_id: &str, totals: Totals) -> Result<()> {
        let group = job_group_id.to_string();
        self.policy
            .run_db(&self.pool, "set_totals", move |conn| summary::set_totals(conn, &group, &totals))
            .await?;
        self.notifier.broadcast("summary:updated", serde_json::json!({
            "jobGroupId": job_group_id,
            "state": SummaryState::Running,
            "totalFull": totals.full,
            "totalIncremental": totals.incremental,
            "totalFailed": totals.failed,
            "totalBytes": totals.bytes,
        }));
        Ok(())
    }

    pub async fn add_restart_seconds(&self, job_group_id: &str, seconds: i64) -> Result<()> {
        let group = job_group_id.to_string();
        self.policy
            .run_db(&self.pool, "add_restart_seconds", move |conn| {
                summary::add_restart_seconds(conn, &group, seconds)
            })
            .await?;
        Ok(())
    }

    /// Close a running summary and return its final row.
    pub async fn finalize_summary(&self, job_group_id: &str, state: SummaryState) -> Result<Summary> {
        let group = job_group_id.to_string();
        let finalized = self
            .policy
            .run_db(&self.pool, "finalize_summary", move |conn| {
                summary::finalize(conn, &group, state)?;
                summary::find(conn, &group)
            })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Summary {job_group_id} not found")))?;
        self.notifier.broadcast("summary:updated", summary_event(&finalized));
        Ok(finalized)
    }

    /// Check the retry preconditions and, when they hold, reset the failed
    /// units and the summary in one transaction. Returns the reset summary and
    /// the databases to re-run. Nothing is modified when a precondition fails.
    /// Reset the failed units of a completed group in one transaction and
    /// return the reset summary with each unit's previous type.
    pub async fn prepare_retry(&self, job_group_id: &str) -> Result<(Summary, Vec<(String, UnitType)>)> {
        let group = job_group_id.to_string();
        let outcome = self
            .policy
            .run_db(&self.pool, "prepare_retry", move |conn| {
                let tx = conn.transaction()?;
                let Some(existing) = summary::find(&tx, &group)? else {
                    return Ok(Err(EngineError::NotFound(format!("Job group {group} not found"))));
                };
                if existing.state != SummaryState::Completed {
                    return Ok(Err(EngineError::Precondition(format!(
                        "Job group {group} is {}; only completed groups can be retried",
                        existing.state
                    ))));
                }
                let failed = job::failed_units(&tx, &group)?;
                if existing.total_failed == 0 || failed.is_empty() {
                    return Ok(Err(EngineError::Precondition(format!(
                        "Job group {group} has no failed units to retry"
                    ))));
                }
                job::reset_failed(&tx, &group)?;
                summary::reset_for_retry(&tx, &group)?;
                let reset = summary::find(&tx, &group)?
                    .ok_or_else(|| anyhow::anyhow!("Summary vanished during retry"))?;
                tx.commit()?;
                Ok(Ok((reset, failed)))
            })
            .await??;

        self.notifier.broadcast("summary:updated", summary_event(&outcome.0));
        Ok(outcome)
    }

    /// Cancel active units of one group, or of every group.
    pub async fn cancel_active(&self, job_group_id: Option<&str>) -> Result<usize> {
        let group = job_group_id.map(str::to_string);
        let cancelled = self
            .policy
            .run_db(&self.pool, "cancel_active", move |conn| job::cancel_active(conn, group.as_deref()))
            .await?;
        if cancelled > 0 {
            self.notifier.broadcast("job:cancelled", serde_json::json!({
                "jobGroupId": job_group_id,
                "count": cancelled,
            }));
        }
        Ok(cancelled)
    }

    /// Close out rows left `running` by a previous process.
    pub async fn recover_interrupted(&self) -> Result<(usize, usize)> {
        let recovered = self
            .policy
            .run_db(&self.pool, "recover_interrupted", |conn| {
                let tx = conn.transaction()?;
                let jobs = job::cancel_active(&tx, None)?;
                let summaries = summary::cancel_running(&tx)?;
                tx.commit()?;
                Ok((jobs, summaries))
            })
            .await?;
        Ok(recovered)
    }

    // ── Reads ──

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let value = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
        Ok(value)
    }

    pub async fn summary(&self, job_group_id: &str) -> Result<Option<Summary>> {
        let group = job_group_id.to_string();
        self.read(move |conn| summary::find(conn, &group)).await
    }

    pub async fn running_summaries(&self) -> Result<Vec<Summary>> {
        self.read(summary::find_running).await
    }

    pub async fn history(&self, page: i64, per_page: i64) -> Result<Page<Summary>> {
        self.read(move |conn| summary::history(conn, page, per_page)).await
    }

    pub async fn job(&self, job_group_id: &str, database_name: &str) -> Result<Option<Job>> {
        let group = job_group_id.to_string();
        let db = database_name.to_string();
        self.read(move |conn| job::find(conn, &group, &db)).await
    }

    pub async fn jobs_for_group(&self, job_group_id: &str) -> Result<Vec<Job>> {
        let group = job_group_id.to_string();
        self.read(move |conn| job::find_by_group(conn, &group)).await
    }

    pub async fn failed_units(&self, job_group_id: &str) -> Result<Vec<(String, UnitType)>> {
        let group = job_group_id.to_string();
        self.read(move |conn| job::failed_units(conn, &group)).await
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>> {
        self.read(job::find_active).await
    }

    pub async fn database_history(&self, database_name: &str, limit: i64) -> Result<Vec<Job>> {
        let db = database_name.to_string();
        self.read(move |conn| job::database_history(conn, &db, limit)).await
    }

    pub async fn grouped_history(&self, per_database: i64) -> Result<Vec<DatabaseHistory>> {
        self.read(move |conn| job::grouped_by_database(conn, per_database)).await
    }

    pub async fn timeline(&self, since: DateTime<Utc>) -> Result<Vec<TimelineDay>> {
        self.read(move |conn| job::timeline(conn, since)).await
    }
}
