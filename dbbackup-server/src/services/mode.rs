//! Splits a request's databases into cohorts by the unit type they run as.

use crate::models::job::UnitType;
use crate::models::summary::BackupMode;
use crate::services::chain;
use chrono::{Duration, NaiveDateTime};
use std::path::Path;

/// Databases that run with the same unit type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    pub unit_type: UnitType,
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub cohorts: Vec<Cohort>,
}

impl Plan {
    fn push(&mut self, unit_type: UnitType, database: String) {
        match self.cohorts.iter_mut().find(|c| c.unit_type == unit_type) {
            Some(cohort) => cohort.databases.push(database),
            None => self.cohorts.push(Cohort {
                unit_type,
                databases: vec![database],
            }),
        }
    }

    pub fn from_units(units: impl IntoIterator<Item = (String, UnitType)>) -> Self {
        let mut plan = Plan::default();
        for (database, unit_type) in units {
            plan.push(unit_type, database);
        }
        plan.order();
        plan
    }

    /// Full cohorts run before incremental ones.
    fn order(&mut self) {
        self.cohorts.sort_by_key(|c| !c.unit_type.is_full());
    }

    pub fn database_count(&self) -> usize {
        self.cohorts.iter().map(|c| c.databases.len()).sum()
    }

    pub fn has_incrementals(&self) -> bool {
        self.cohorts.iter().any(|c| !c.unit_type.is_full())
    }

    /// Turn every incremental cohort into its full counterpart.
    pub fn force_full(&mut self) {
        let cohorts = std::mem::take(&mut self.cohorts);
        for cohort in cohorts {
            let unit_type = cohort.unit_type.as_full();
            for database in cohort.databases {
                self.push(unit_type, database);
            }
        }
        self.order();
    }
}

/// Decide the unit type of every database. In auto mode a database runs a
/// full backup when it has none, or when its newest full is at least
/// `full_interval` old; otherwise it runs an incremental.
pub async fn resolve(
    mode: BackupMode,
    databases: &[String],
    backup_dir: &Path,
    full_interval: Duration,
    now: NaiveDateTime,
) -> Plan {
    let mut units = Vec::with_capacity(databases.len());
    for database in databases {
        let unit_type = match mode {
            BackupMode::Full => UnitType::ForcedFull,
            BackupMode::Incremental => UnitType::ForcedIncremental,
            BackupMode::Auto => match chain::scan(backup_dir, database).await {
                Ok(artifacts) => match chain::latest_full(&artifacts) {
                    Some(last_full) if now - last_full < full_interval => UnitType::AutoIncremental,
                    _ => UnitType::AutoFull,
                },
                Err(e) => {
                    tracing::warn!(database = %database, error = %e, "Cannot read backup directory, planning a full backup");
                    UnitType::AutoFull
                }
            },
        };
        units.push((database.clone(), unit_type));
    }
    Plan::from_units(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::chain::{artifact_name, ArtifactKind};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap().and_hms_opt(2, 0, 0).unwrap()
    }

    async fn full_at(root: &Path, db: &str, at: NaiveDateTime) {
        let dir = root.join(db);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(artifact_name(ArtifactKind::Full, db, at, true)), b"x").await.unwrap();
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn auto_mode_splits_by_age_of_last_full() {
        let dir = tempfile::tempdir().unwrap();
        full_at(dir.path(), "fresh", day(9)).await;
        full_at(dir.path(), "stale", day(1)).await;

        let plan = resolve(
            BackupMode::Auto,
            &names(&["fresh", "stale", "new"]),
            dir.path(),
            Duration::days(7),
            day(10),
        )
        .await;

        assert_eq!(plan.cohorts.len(), 2);
        assert_eq!(plan.cohorts[0].unit_type, UnitType::AutoFull);
        assert_eq!(plan.cohorts[0].databases, names(&["stale", "new"]));
        assert_eq!(plan.cohorts[1].unit_type, UnitType::AutoIncremental);
        assert_eq!(plan.cohorts[1].databases, names(&["fresh"]));
        assert_eq!(plan.database_count(), 3);
    }

    #[tokio::test]
    async fn forced_modes_ignore_history() {
        let dir = tempfile::tempdir().unwrap();
        let plan = resolve(BackupMode::Incremental, &names(&["a", "b"]), dir.path(), Duration::days(7), day(10)).await;
        assert_eq!(plan.cohorts.len(), 1);
        assert_eq!(plan.cohorts[0].unit_type, UnitType::ForcedIncremental);

        let plan = resolve(BackupMode::Full, &names(&["a"]), dir.path(), Duration::days(7), day(10)).await;
        assert_eq!(plan.cohorts[0].unit_type, UnitType::ForcedFull);
    }

    #[test]
    fn force_full_merges_cohorts() {
        let mut plan = Plan::from_units(vec![
            ("a".to_string(), UnitType::AutoIncremental),
            ("b".to_string(), UnitType::AutoFull),
        ]);
        assert_eq!(plan.cohorts[0].unit_type, UnitType::AutoFull);
        assert!(plan.has_incrementals());

        plan.force_full();
        assert!(!plan.has_incrementals());
        assert_eq!(plan.cohorts.len(), 1);
        assert_eq!(plan.cohorts[0].databases, names(&["b", "a"]));
    }
}
