use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Kind of backup actually executed for one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    ForcedFull,
    ForcedIncremental,
    AutoFull,
    AutoIncremental,
}

text_enum!(UnitType {
    ForcedFull => "forced_full",
    ForcedIncremental => "forced_incremental",
    AutoFull => "auto_full",
    AutoIncremental => "auto_incremental",
});

impl UnitType {
    pub fn is_full(&self) -> bool {
        matches!(self, UnitType::ForcedFull | UnitType::AutoFull)
    }

    /// The full-backup counterpart used when an incremental cannot run.
    pub fn as_full(&self) -> UnitType {
        match self {
            UnitType::ForcedFull | UnitType::ForcedIncremental => UnitType::ForcedFull,
            UnitType::AutoFull | UnitType::AutoIncremental => UnitType::AutoFull,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Optimizing,
    Running,
    Done,
    Failed,
    Cancelled,
}

text_enum!(JobStatus {
    Optimizing => "optimizing",
    Running => "running",
    Done => "done",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

static LAST_SEQ: AtomicI64 = AtomicI64::new(0);

/// Strictly increasing write sequence, anchored to wall-clock microseconds so
/// it keeps increasing across restarts.
pub fn next_seq() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_SEQ.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_SEQ.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

// ── Job ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_group_id: String,
    pub database_name: String,
    pub unit_type: UnitType,
    pub status: JobStatus,
    pub progress: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_size: Option<i64>,
    pub actual_size: Option<i64>,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_group_id: String,
    pub database_name: String,
    pub unit_type: UnitType,
    pub status: JobStatus,
    pub estimated_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub job_group_id: String,
    pub database_name: String,
    pub progress: i64,
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub job_group_id: String,
    pub database_name: String,
    pub status: JobStatus,
    pub seq: i64,
    pub progress: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_size: Option<i64>,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(job_group_id: &str, database_name: &str, status: JobStatus) -> Self {
        Self {
            job_group_id: job_group_id.to_string(),
            database_name: database_name.to_string(),
            status,
            seq: next_seq(),
            progress: None,
            completed_at: if status.is_terminal() { Some(Utc::now()) } else { None },
            actual_size: None,
            output_path: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHistory {
    pub database_name: String,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineDay {
    pub day: String,
    pub units: i64,
    pub full: i64,
    pub incremental: i64,
    pub failed: i64,
    pub bytes: i64,
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        job_group_id: row.get("job_group_id")?,
        database_name: row.get("database_name")?,
        unit_type: row.get("unit_type")?,
        status: row.get("status")?,
        progress: row.get("progress")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        estimated_size: row.get("estimated_size")?,
        actual_size: row.get("actual_size")?,
        output_path: row.get("output_path")?,
        error: row.get("error")?,
    })
}

/// Record the start of a unit. An existing row for the same (group, database)
/// is reset, which is what a retried unit needs.
pub fn start(conn: &Connection, data: &NewJob) -> anyhow::Result<Job> {
    let seq = next_seq();
    conn.execute(
        "INSERT INTO backup_jobs (job_group_id, database_name, unit_type, status, progress, started_at, estimated_size, progress_seq, status_seq)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7)
         ON CONFLICT(job_group_id, database_name) DO UPDATE SET
           unit_type = excluded.unit_type,
           status = excluded.status,
           progress = 0,
           started_at = excluded.started_at,
           completed_at = NULL,
           estimated_size = excluded.estimated_size,
           actual_size = NULL,
           output_path = NULL,
           error = NULL,
           progress_seq = excluded.progress_seq,
           status_seq = excluded.status_seq",
        params![
            data.job_group_id,
            data.database_name,
            data.unit_type,
            data.status,
            Utc::now(),
            data.estimated_size,
            seq,
        ],
    )?;
    find(conn, &data.job_group_id, &data.database_name)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created job"))
}

pub fn find(conn: &Connection, job_group_id: &str, database_name: &str) -> anyhow::Result<Option<Job>> {
    let job = conn
        .query_row(
            "SELECT * FROM backup_jobs WHERE job_group_id = ? AND database_name = ?",
            params![job_group_id, database_name],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

pub fn find_by_group(conn: &Connection, job_group_id: &str) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs WHERE job_group_id = ? ORDER BY database_name",
    )?;
    let rows = stmt.query_map(params![job_group_id], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs WHERE status IN ('optimizing', 'running') ORDER BY started_at",
    )?;
    let rows = stmt.query_map([], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Failed units of a group with the unit type they last ran as.
pub fn failed_units(conn: &Connection, job_group_id: &str) -> anyhow::Result<Vec<(String, UnitType)>> {
    let mut stmt = conn.prepare(
        "SELECT database_name, unit_type FROM backup_jobs
         WHERE job_group_id = ? AND status = 'failed' ORDER BY database_name",
    )?;
    let rows = stmt.query_map(params![job_group_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Put the group's failed units back to a clean `running` row.
pub fn reset_failed(conn: &Connection, job_group_id: &str) -> anyhow::Result<usize> {
    let seq = next_seq();
    let changes = conn.execute(
        "UPDATE backup_jobs
         SET status = 'running', progress = 0, error = NULL, actual_size = NULL, completed_at = NULL,
             progress_seq = ?1, status_seq = ?1
         WHERE job_group_id = ?2 AND status = 'failed'",
        params![seq, job_group_id],
    )?;
    Ok(changes)
}

/// Apply one progress update. Stale sequences and finished units are skipped.
pub fn update_progress(conn: &Connection, update: &ProgressUpdate) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_jobs SET progress = ?1, progress_seq = ?2
         WHERE job_group_id = ?3 AND database_name = ?4
           AND progress_seq < ?2 AND status IN ('optimizing', 'running')",
        params![
            update.progress.clamp(0, 100),
            update.seq,
            update.job_group_id,
            update.database_name,
        ],
    )?;
    Ok(changes > 0)
}

/// Apply one status update. Stale sequences are skipped and a unit that has
/// reached a terminal status keeps it.
pub fn update_status(conn: &Connection, update: &StatusUpdate) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_jobs SET
           status = ?1,
           status_seq = ?2,
           progress = COALESCE(?3, progress),
           completed_at = COALESCE(?4, completed_at),
           actual_size = COALESCE(?5, actual_size),
           output_path = COALESCE(?6, output_path),
           error = COALESCE(?7, error)
         WHERE job_group_id = ?8 AND database_name = ?9
           AND status_seq < ?2 AND status IN ('optimizing', 'running')",
        params![
            update.status,
            update.seq,
            update.progress.map(|p| p.clamp(0, 100)),
            update.completed_at,
            update.actual_size,
            update.output_path,
            update.error,
            update.job_group_id,
            update.database_name,
        ],
    )?;
    Ok(changes > 0)
}

/// Mark active units cancelled, either for one group or for all groups.
pub fn cancel_active(conn: &Connection, job_group_id: Option<&str>) -> anyhow::Result<usize> {
    let seq = next_seq();
    let changes = match job_group_id {
        Some(group) => conn.execute(
            "UPDATE backup_jobs SET status = 'cancelled', completed_at = ?1, status_seq = ?2
             WHERE job_group_id = ?3 AND status IN ('optimizing', 'running')",
            params![Utc::now(), seq, group],
        )?,
        None => conn.execute(
            "UPDATE backup_jobs SET status = 'cancelled', completed_at = ?1, status_seq = ?2
             WHERE status IN ('optimizing', 'running')",
            params![Utc::now(), seq],
        )?,
    };
    Ok(changes)
}

pub fn database_history(conn: &Connection, database_name: &str, limit: i64) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs WHERE database_name = ? ORDER BY started_at DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![database_name, limit], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent `per_database` units of every database, grouped by database name.
pub fn grouped_by_database(conn: &Connection, per_database: i64) -> anyhow::Result<Vec<DatabaseHistory>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM (
           SELECT *, ROW_NUMBER() OVER (PARTITION BY database_name ORDER BY started_at DESC) AS rn
           FROM backup_jobs
         ) WHERE rn <= ? ORDER BY database_name, started_at DESC",
    )?;
    let rows = stmt.query_map(params![per_database], row_to_job)?;

    let mut grouped: Vec<DatabaseHistory> = Vec::new();
    for job in rows {
        let job = job?;
        match grouped.last_mut() {
            Some(last) if last.database_name == job.database_name => last.jobs.push(job),
            _ => grouped.push(DatabaseHistory {
                database_name: job.database_name.clone(),
                jobs: vec![job],
            }),
        }
    }
    Ok(grouped)
}

/// Per-day unit counts and bytes since `since`, oldest day first.
pub fn timeline(conn: &Connection, since: DateTime<Utc>) -> anyhow::Result<Vec<TimelineDay>> {
    let mut stmt = conn.prepare(
        "SELECT substr(started_at, 1, 10) AS day,
                COUNT(*) AS units,
                SUM(CASE WHEN status = 'done' AND unit_type IN ('forced_full', 'auto_full') THEN 1 ELSE 0 END) AS full,
                SUM(CASE WHEN status = 'done' AND unit_type IN ('forced_incremental', 'auto_incremental') THEN 1 ELSE 0 END) AS incremental,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                COALESCE(SUM(CASE WHEN status = 'done' THEN actual_size ELSE 0 END), 0) AS bytes
         FROM backup_jobs
         WHERE started_at >= ?
         GROUP BY day
         ORDER BY day",
    )?;
    let rows = stmt.query_map(params![since], |row| {
        Ok(TimelineDay {
            day: row.get("day")?,
            units: row.get("units")?,
            full: row.get("full")?,
            incremental: row.get("incremental")?,
            failed: row.get("failed")?,
            bytes: row.get("bytes")?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
