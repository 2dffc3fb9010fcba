//! Deletes whole backup chains once their full backup is past retention.

use crate::services::chain::{self, Chain};
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub databases: usize,
    pub chains_removed: usize,
    pub files_removed: usize,
    pub bytes_removed: u64,
}

/// Remove every chain older than `retention_days` from each database directory
/// under `backup_dir`. The newest chain of a database is always kept, however
/// old, so a database that stopped being backed up keeps its last restore point.
pub async fn cleanup(backup_dir: &Path, retention_days: i64, now: NaiveDateTime) -> std::io::Result<RetentionReport> {
    let mut report = RetentionReport::default();
    if retention_days <= 0 {
        return Ok(report);
    }
    let cutoff = now - Duration::days(retention_days);

    let mut entries = match tokio::fs::read_dir(backup_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(database) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        report.databases += 1;

        let artifacts = chain::scan(backup_dir, &database).await?;
        let mut chains = chain::group_chains(artifacts);
        // Newest chain stays
        chains.pop();

        for expired in chains.iter().filter(|c| c.started_at().is_some_and(|t| t < cutoff)) {
            remove_chain(expired, &mut report).await;
            tracing::info!(
                database = %database,
                started_at = ?expired.started_at(),
                files = expired.artifacts().count(),
                "Removed expired backup chain"
            );
        }
    }
    Ok(report)
}

async fn remove_chain(chain: &Chain, report: &mut RetentionReport) {
    report.chains_removed += 1;
    for artifact in chain.artifacts() {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {
                report.files_removed += 1;
                report.bytes_removed += artifact.size;
            }
            Err(e) => tracing::warn!(path = %artifact.path.display(), error = %e, "Cannot remove artifact"),
        }
        let log = chain::side_log_path(&artifact.path);
        if let Ok(meta) = tokio::fs::metadata(&log).await {
            if tokio::fs::remove_file(&log).await.is_ok() {
                report.files_removed += 1;
                report.bytes_removed += meta.len();
            }
        }
    }
}
