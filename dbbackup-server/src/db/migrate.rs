use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_summaries (
  job_group_id TEXT PRIMARY KEY,
  requested_count INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT 'running' CHECK(state IN ('running','completed','cancelled')),
  completed_at TEXT,
  total_full INTEGER NOT NULL DEFAULT 0,
  total_incremental INTEGER NOT NULL DEFAULT 0,
  total_failed INTEGER NOT NULL DEFAULT 0,
  total_bytes INTEGER NOT NULL DEFAULT 0,
  total_disk_bytes INTEGER NOT NULL DEFAULT 0,
  mode TEXT NOT NULL CHECK(mode IN ('full','incremental','auto')),
  restart_seconds INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS backup_jobs (
  job_group_id TEXT NOT NULL REFERENCES backup_summaries(job_group_id) ON DELETE CASCADE,
  database_name TEXT NOT NULL,
  unit_type TEXT NOT NULL CHECK(unit_type IN ('forced_full','forced_incremental','auto_full','auto_incremental')),
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('optimizing','running','done','failed','cancelled')),
  progress INTEGER NOT NULL DEFAULT 0 CHECK(progress BETWEEN 0 AND 100),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  estimated_size INTEGER,
  actual_size INTEGER,
  output_path TEXT,
  error TEXT,
  progress_seq INTEGER NOT NULL DEFAULT 0,
  status_seq INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (job_group_id, database_name)
);

CREATE INDEX IF NOT EXISTS idx_backup_jobs_status ON backup_jobs(status);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_database ON backup_jobs(database_name, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_summaries_created ON backup_summaries(created_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
