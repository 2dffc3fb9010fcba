use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Backup kind requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Incremental,
    Auto,
}

text_enum!(BackupMode {
    Full => "full",
    Incremental => "incremental",
    Auto => "auto",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryState {
    Running,
    Completed,
    Cancelled,
}

text_enum!(SummaryState {
    Running => "running",
    Completed => "completed",
    Cancelled => "cancelled",
});

// ── Summary ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub job_group_id: String,
    pub requested_count: i64,
    pub created_at: DateTime<Utc>,
    pub state: SummaryState,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_full: i64,
    pub total_incremental: i64,
    pub total_failed: i64,
    pub total_bytes: i64,
    pub total_disk_bytes: i64,
    pub mode: BackupMode,
    pub restart_seconds: i64,
}

impl Summary {
    pub fn accounted(&self) -> i64 {
        self.total_full + self.total_incremental + self.total_failed
    }
}

/// Running totals of one request, accumulated in memory by the workers and
/// written to the summary row as absolute values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub full: i64,
    pub incremental: i64,
    pub failed: i64,
    pub bytes: i64,
    pub disk_bytes: i64,
}

impl Totals {
    pub fn from_summary(summary: &Summary) -> Self {
        Self {
            full: summary.total_full,
            incremental: summary.total_incremental,
            failed: summary.total_failed,
            bytes: summary.total_bytes,
            disk_bytes: summary.total_disk_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

fn row_to_summary(row: &Row) -> rusqlite::Result<Summary> {
    Ok(Summary {
        job_group_id: row.get("job_group_id")?,
        requested_count: row.get("requested_count")?,
        created_at: row.get("created_at")?,
        state: row.get("state")?,
        completed_at: row.get("completed_at")?,
        total_full: row.get("total_full")?,
        total_incremental: row.get("total_incremental")?,
        total_failed: row.get("total_failed")?,
        total_bytes: row.get("total_bytes")?,
        total_disk_bytes: row.get("total_disk_bytes")?,
        mode: row.get("mode")?,
        restart_seconds: row.get("restart_seconds")?,
    })
}

pub fn create(conn: &Connection, job_group_id: &str, requested_count: i64, mode: BackupMode) -> anyhow::Result<Summary> {
    conn.execute(
        "INSERT INTO backup_summaries (job_group_id, requested_count, created_at, state, mode)
         VALUES (?1, ?2, ?3, 'running', ?4)",
        params![job_group_id, requested_count, Utc::now(), mode],
    )?;
    find(conn, job_group_id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created summary"))
}

pub fn find(conn: &Connection, job_group_id: &str) -> anyhow::Result<Option<Summary>> {
    let summary = conn
        .query_row(
            "SELECT * FROM backup_summaries WHERE job_group_id = ?",
            params![job_group_id],
            row_to_summary,
        )
        .optional()?;
    Ok(summary)
}

pub fn find_running(conn: &Connection) -> anyhow::Result<Vec<Summary>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_summaries WHERE state = 'running' ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([], row_to_summary)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Newest-first page of summaries; `page` is 1-based.
pub fn history(conn: &Connection, page: i64, per_page: i64) -> anyhow::Result<Page<Summary>> {
    let page = page.max(1);
    let per_page = per_page.clamp(1, 500);
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM backup_summaries", [], |row| row.get(0))?;
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_summaries ORDER BY created_at DESC LIMIT ? OFFSET ?",
    )?;
    let rows = stmt.query_map(params![per_page, (page - 1) * per_page], row_to_summary)?;
    Ok(Page {
        items: rows.collect::<rusqlite::Result<Vec<_>>>()?,
        total,
        page,
        per_page,
    })
}

pub fn set_totals(conn: &Connection, job_group_id: &str, totals: &Totals) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_summaries
         SET total_full = ?, total_incremental = ?, total_failed = ?, total_bytes = ?, total_disk_bytes = ?
         WHERE job_group_id = ?",
        params![
            totals.full,
            totals.incremental,
            totals.failed,
            totals.bytes,
            totals.disk_bytes,
            job_group_id,
        ],
    )?;
    Ok(())
}

pub fn add_restart_seconds(conn: &Connection, job_group_id: &str, seconds: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_summaries SET restart_seconds = restart_seconds + ? WHERE job_group_id = ?",
        params![seconds, job_group_id],
    )?;
    Ok(())
}

/// Close a running summary. Returns false when it was already closed.
pub fn finalize(conn: &Connection, job_group_id: &str, state: SummaryState) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_summaries SET state = ?, completed_at = ? WHERE job_group_id = ? AND state = 'running'",
        params![state, Utc::now(), job_group_id],
    )?;
    Ok(changes > 0)
}

/// Put a completed summary back into `running` for a retry of its failed units.
pub fn reset_for_retry(conn: &Connection, job_group_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_summaries SET state = 'running', total_failed = 0, completed_at = NULL WHERE job_group_id = ?",
        params![job_group_id],
    )?;
    Ok(())
}

/// Cancel every summary still marked running; returns the number touched.
pub fn cancel_running(conn: &Connection) -> anyhow::Result<usize> {
    let changes = conn.execute(
        "UPDATE backup_summaries SET state = 'cancelled', completed_at = ? WHERE state = 'running'",
        params![Utc::now()],
    )?;
    Ok(changes)
}
