//! Backup chains on disk.
//!
//! Artifacts live in `<backup_dir>/<database>/` and are named
//! `{full|inc}_{database}_{YYYYmmdd-HHMMSS.ffffff}.{sql|sql.gz}`. The embedded
//! timestamp is the point in time the artifact covers up to; an incremental
//! always starts one microsecond after the newest artifact of its database.

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::path::{Path, PathBuf};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Full,
    Incremental,
}

impl ArtifactKind {
    fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Full => "full",
            ArtifactKind::Incremental => "inc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub database: String,
    pub kind: ArtifactKind,
    pub timestamp: NaiveDateTime,
    pub size: u64,
}

/// One full backup and the incrementals that depend on it. A chain without a
/// full holds incrementals whose full is gone.
#[derive(Debug, Clone, Serialize)]
pub struct Chain {
    pub full: Option<Artifact>,
    pub incrementals: Vec<Artifact>,
}

impl Chain {
    /// Timestamp of the chain's first artifact.
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.full
            .as_ref()
            .or_else(|| self.incrementals.first())
            .map(|a| a.timestamp)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.full.iter().chain(self.incrementals.iter())
    }
}

pub fn database_dir(backup_dir: &Path, database: &str) -> PathBuf {
    backup_dir.join(database)
}

/// Tool output captured next to an artifact: `<artifact>.log`.
pub fn side_log_path(artifact: &Path) -> PathBuf {
    let mut path = artifact.as_os_str().to_owned();
    path.push(".log");
    PathBuf::from(path)
}

pub fn artifact_name(kind: ArtifactKind, database: &str, timestamp: NaiveDateTime, compressed: bool) -> String {
    let ext = if compressed { "sql.gz" } else { "sql" };
    format!("{}_{}_{}.{}", kind.prefix(), database, timestamp.format(STAMP_FORMAT), ext)
}

/// Parse an artifact file name back into its kind, database and timestamp.
/// Anything else in the directory (side logs, temp files) yields `None`.
pub fn parse_artifact_name(file_name: &str) -> Option<(ArtifactKind, String, NaiveDateTime)> {
    let (kind, rest) = if let Some(rest) = file_name.strip_prefix("full_") {
        (ArtifactKind::Full, rest)
    } else if let Some(rest) = file_name.strip_prefix("inc_") {
        (ArtifactKind::Incremental, rest)
    } else {
        return None;
    };
    let stem = rest
        .strip_suffix(".sql.gz")
        .or_else(|| rest.strip_suffix(".sql"))?;
    // Database names may contain underscores; the stamp never does
    let (database, stamp) = stem.rsplit_once('_')?;
    if database.is_empty() {
        return None;
    }
    let timestamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    Some((kind, database.to_string(), timestamp))
}

/// All artifacts of `database`, oldest first. A missing directory is an empty
/// chain, not an error.
pub async fn scan(backup_dir: &Path, database: &str) -> std::io::Result<Vec<Artifact>> {
    let dir = database_dir(backup_dir, database);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut artifacts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some((kind, db, timestamp)) = name.to_str().and_then(parse_artifact_name) else {
            continue;
        };
        if db != database {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        artifacts.push(Artifact {
            path: entry.path(),
            database: db,
            kind,
            timestamp,
            size: meta.len(),
        });
    }
    artifacts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.kind.prefix().cmp(b.kind.prefix())));
    Ok(artifacts)
}

/// Newest point covered by any artifact, full or incremental.
pub fn latest_point(artifacts: &[Artifact]) -> Option<NaiveDateTime> {
    artifacts.iter().map(|a| a.timestamp).max()
}

pub fn latest_full(artifacts: &[Artifact]) -> Option<NaiveDateTime> {
    artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::Full)
        .map(|a| a.timestamp)
        .max()
}

/// Start of the next incremental window, or `None` when the database has no
/// prior backup and needs a full one.
pub async fn next_incremental_start(backup_dir: &Path, database: &str) -> std::io::Result<Option<NaiveDateTime>> {
    let artifacts = scan(backup_dir, database).await?;
    Ok(latest_point(&artifacts).map(|t| t + Duration::microseconds(1)))
}

/// Split chronologically ordered artifacts into chains: every full opens a new
/// chain, incrementals join the chain before them.
pub fn group_chains(artifacts: Vec<Artifact>) -> Vec<Chain> {
    let mut sorted = artifacts;
    sorted.sort_by_key(|a| a.timestamp);

    let mut chains: Vec<Chain> = Vec::new();
    for artifact in sorted {
        match artifact.kind {
            ArtifactKind::Full => chains.push(Chain {
                full: Some(artifact),
                incrementals: Vec::new(),
            }),
            ArtifactKind::Incremental => match chains.last_mut() {
                Some(chain) => chain.incrementals.push(artifact),
                None => chains.push(Chain {
                    full: None,
                    incrementals: vec![artifact],
                }),
            },
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_micro_opt(h, m, s, micro)
            .unwrap()
    }

    async fn touch(dir: &Path, name: &str, bytes: usize) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(dir.join(name), vec![b'x'; bytes]).await.unwrap();
    }

    #[test]
    fn names_parse_back() {
        let t = at(2, 0, 0, 123456);
        let name = artifact_name(ArtifactKind::Incremental, "shop_eu", t, true);
        assert_eq!(name, "inc_shop_eu_20250314-020000.123456.sql.gz");
        assert_eq!(
            parse_artifact_name(&name),
            Some((ArtifactKind::Incremental, "shop_eu".to_string(), t))
        );

        let plain = artifact_name(ArtifactKind::Full, "a", t, false);
        assert_eq!(parse_artifact_name(&plain).unwrap().0, ArtifactKind::Full);
    }

    #[test]
    fn foreign_files_are_ignored() {
        assert!(parse_artifact_name("full_a_20250314-020000.123456.sql.gz.log").is_none());
        assert!(parse_artifact_name("notes.txt").is_none());
        assert!(parse_artifact_name("full_a_yesterday.sql").is_none());
        assert!(parse_artifact_name("full__20250314-020000.123456.sql").is_none());
    }

    #[tokio::test]
    async fn incremental_starts_one_microsecond_after_full() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = at(2, 0, 0, 0);
        touch(&dir.path().join("a"), &artifact_name(ArtifactKind::Full, "a", t0, true), 10).await;

        let start = next_incremental_start(dir.path(), "a").await.unwrap();
        assert_eq!(start, Some(t0 + Duration::microseconds(1)));
    }

    #[tokio::test]
    async fn newest_incremental_wins_over_older_full() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("a");
        touch(&db_dir, &artifact_name(ArtifactKind::Full, "a", at(2, 0, 0, 0), true), 10).await;
        touch(&db_dir, &artifact_name(ArtifactKind::Incremental, "a", at(8, 0, 0, 5), true), 10).await;
        touch(&db_dir, &artifact_name(ArtifactKind::Incremental, "a", at(5, 0, 0, 0), true), 10).await;

        let start = next_incremental_start(dir.path(), "a").await.unwrap().unwrap();
        assert_eq!(start, at(8, 0, 0, 6));
        assert!(start > at(8, 0, 0, 5));
    }

    #[tokio::test]
    async fn no_artifacts_means_no_prior_backup() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_incremental_start(dir.path(), "a").await.unwrap(), None);

        // Artifacts of another database in the same directory do not count
        touch(&dir.path().join("a"), &artifact_name(ArtifactKind::Full, "b", at(1, 0, 0, 0), false), 1).await;
        assert_eq!(next_incremental_start(dir.path(), "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn chains_group_incrementals_under_their_full() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("a");
        touch(&db_dir, &artifact_name(ArtifactKind::Incremental, "a", at(0, 30, 0, 0), true), 1).await;
        touch(&db_dir, &artifact_name(ArtifactKind::Full, "a", at(1, 0, 0, 0), true), 100).await;
        touch(&db_dir, &artifact_name(ArtifactKind::Incremental, "a", at(2, 0, 0, 0), true), 5).await;
        touch(&db_dir, &artifact_name(ArtifactKind::Incremental, "a", at(3, 0, 0, 0), true), 5).await;
        touch(&db_dir, &artifact_name(ArtifactKind::Full, "a", at(4, 0, 0, 0), true), 100).await;
        touch(&db_dir, "full_a_20250314-010000.000000.sql.gz.log", 3).await;

        let artifacts = scan(dir.path(), "a").await.unwrap();
        assert_eq!(artifacts.len(), 5);
        assert_eq!(latest_full(&artifacts), Some(at(4, 0, 0, 0)));

        let chains = group_chains(artifacts);
        assert_eq!(chains.len(), 3);
        assert!(chains[0].full.is_none());
        assert_eq!(chains[0].started_at(), Some(at(0, 30, 0, 0)));
        assert_eq!(chains[1].incrementals.len(), 2);
        assert_eq!(chains[1].artifacts().map(|a| a.size).sum::<u64>(), 110);
        assert!(chains[2].incrementals.is_empty());
    }
}
