//! Configuration management for the backup server.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::error::{EngineError, Result};
use crate::models::summary::BackupMode;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bounds that keep schedule and retention arithmetic in range.
pub const MAX_INTERVAL_HOURS: u64 = 24 * 366;
pub const MAX_DAYS: i64 = 36_600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the state database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub mysql: MysqlConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    #[serde(default = "default_mysql_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Unix socket, preferred over host/port when set
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root directory; each database gets its own subdirectory
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Maximum number of units in flight per request
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Gzip artifacts (`.sql.gz`) instead of plain `.sql`
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Run dump tools under `nice -n <level>`
    #[serde(default)]
    pub nice_level: Option<i32>,

    /// Run `mysqlcheck --optimize` before each full dump
    #[serde(default)]
    pub optimize_tables: bool,

    /// Databases never picked up when a request does not name databases
    #[serde(default)]
    pub exclude_databases: Vec<String>,

    #[serde(default)]
    pub binaries: BinaryPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryPaths {
    #[serde(default = "default_mysqldump")]
    pub mysqldump: PathBuf,

    #[serde(default = "default_mysqlbinlog")]
    pub mysqlbinlog: PathBuf,

    #[serde(default = "default_mysql")]
    pub mysql: PathBuf,

    #[serde(default = "default_mysqlcheck")]
    pub mysqlcheck: PathBuf,

    #[serde(default = "default_mysqladmin")]
    pub mysqladmin: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Used-memory percentage above which no new unit may start
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_percent: f64,

    /// Service names tried in order when restarting the database server
    #[serde(default = "default_service_names")]
    pub service_names: Vec<String>,

    #[serde(default = "default_restart_poll_secs")]
    pub restart_poll_secs: u64,

    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// How often workers re-check while another worker restarts the service
    #[serde(default = "default_wait_poll_millis")]
    pub wait_poll_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Daily start time, `HH:MM` local time
    #[serde(default = "default_start_time")]
    pub start_time: String,

    /// Hours between runs; 0 disables the scheduler
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    #[serde(default = "default_mode")]
    pub default_mode: BackupMode,

    /// In auto mode, a database gets a new full backup once its last full is this old
    #[serde(default = "default_full_interval_days")]
    pub full_interval_days: i64,

    /// Delay between a scheduled run and its retention cleanup
    #[serde(default = "default_retention_delay_secs")]
    pub retention_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Chains whose full backup is older than this are deleted; 0 keeps everything
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_millis")]
    pub flush_interval_millis: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_millis")]
    pub retry_base_millis: u64,

    #[serde(default = "default_retry_max_millis")]
    pub retry_max_millis: u64,

    /// SQLite busy timeout; kept short so contention reaches the retry policy
    #[serde(default = "default_busy_timeout_millis")]
    pub busy_timeout_millis: u64,

    /// Pause after the last worker exits so batched writes land before finalizing
    #[serde(default = "default_completion_grace_millis")]
    pub completion_grace_millis: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving the finalized summary of every request
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbbackup")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_mysql_user() -> String {
    "root".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/backup/mysql")
}

fn default_parallelism() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_mysqldump() -> PathBuf {
    PathBuf::from("mysqldump")
}

fn default_mysqlbinlog() -> PathBuf {
    PathBuf::from("mysqlbinlog")
}

fn default_mysql() -> PathBuf {
    PathBuf::from("mysql")
}

fn default_mysqlcheck() -> PathBuf {
    PathBuf::from("mysqlcheck")
}

fn default_mysqladmin() -> PathBuf {
    PathBuf::from("mysqladmin")
}

fn default_memory_threshold() -> f64 {
    90.0
}

fn default_service_names() -> Vec<String> {
    vec!["mysql".into(), "mysqld".into(), "mariadb".into()]
}

fn default_restart_poll_secs() -> u64 {
    5
}

fn default_restart_window_secs() -> u64 {
    600
}

fn default_wait_poll_millis() -> u64 {
    1000
}

fn default_start_time() -> String {
    "02:00".to_string()
}

fn default_interval_hours() -> u64 {
    24
}

fn default_mode() -> BackupMode {
    BackupMode::Auto
}

fn default_full_interval_days() -> i64 {
    7
}

fn default_retention_delay_secs() -> u64 {
    60
}

fn default_retention_days() -> i64 {
    14
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval_millis() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_millis() -> u64 {
    50
}

fn default_retry_max_millis() -> u64 {
    2000
}

fn default_busy_timeout_millis() -> u64 {
    250
}

fn default_completion_grace_millis() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_mysql_port(),
            user: default_mysql_user(),
            password: String::new(),
            socket: None,
        }
    }
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            mysqldump: default_mysqldump(),
            mysqlbinlog: default_mysqlbinlog(),
            mysql: default_mysql(),
            mysqlcheck: default_mysqlcheck(),
            mysqladmin: default_mysqladmin(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            parallelism: default_parallelism(),
            compress: true,
            nice_level: None,
            optimize_tables: false,
            exclude_databases: Vec::new(),
            binaries: BinaryPaths::default(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            memory_threshold_percent: default_memory_threshold(),
            service_names: default_service_names(),
            restart_poll_secs: default_restart_poll_secs(),
            restart_window_secs: default_restart_window_secs(),
            wait_poll_millis: default_wait_poll_millis(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_time: default_start_time(),
            interval_hours: default_interval_hours(),
            default_mode: default_mode(),
            full_interval_days: default_full_interval_days(),
            retention_delay_secs: default_retention_delay_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_millis: default_flush_interval_millis(),
            queue_capacity: default_queue_capacity(),
            retry_attempts: default_retry_attempts(),
            retry_base_millis: default_retry_base_millis(),
            retry_max_millis: default_retry_max_millis(),
            busy_timeout_millis: default_busy_timeout_millis(),
            completion_grace_millis: default_completion_grace_millis(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mysql: MysqlConfig::default(),
            backup: BackupConfig::default(),
            admission: AdmissionConfig::default(),
            schedule: ScheduleConfig::default(),
            retention: RetentionConfig::default(),
            store: StoreConfig::default(),
            notify: NotifyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();

        if let Ok(v) = std::env::var("DBBACKUP_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DBBACKUP_BACKUP_DIR") {
            self.backup.backup_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DBBACKUP_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("DBBACKUP_WEBHOOK_URL") {
            self.notify.webhook_url = Some(v);
        }
        if let Ok(v) = std::env::var("MYSQL_HOST") {
            self.mysql.host = v;
        }
        if let Some(port) = std::env::var("MYSQL_PORT").ok().and_then(|v| v.parse().ok()) {
            self.mysql.port = port;
        }
        if let Ok(v) = std::env::var("MYSQL_USER") {
            self.mysql.user = v;
        }
        if let Ok(v) = std::env::var("MYSQL_PASSWORD") {
            self.mysql.password = v;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dbbackup.db")
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.backup.parallelism == 0 {
            return Err(EngineError::Config("backup.parallelism must be at least 1".into()));
        }
        let threshold = self.admission.memory_threshold_percent;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(EngineError::Config(format!(
                "admission.memory_threshold_percent must be in (0, 100], got {threshold}"
            )));
        }
        if self.admission.service_names.is_empty() {
            return Err(EngineError::Config("admission.service_names must not be empty".into()));
        }
        self.schedule.start_time()?;
        if self.schedule.interval_hours > MAX_INTERVAL_HOURS {
            return Err(EngineError::Config(format!(
                "schedule.interval_hours must be at most {MAX_INTERVAL_HOURS}, got {}",
                self.schedule.interval_hours
            )));
        }
        if !(1..=MAX_DAYS).contains(&self.schedule.full_interval_days) {
            return Err(EngineError::Config(format!(
                "schedule.full_interval_days must be in 1..={MAX_DAYS}, got {}",
                self.schedule.full_interval_days
            )));
        }
        if self.retention.retention_days > MAX_DAYS {
            return Err(EngineError::Config(format!(
                "retention.retention_days must be at most {MAX_DAYS}, got {}",
                self.retention.retention_days
            )));
        }
        if self.store.batch_size == 0 || self.store.queue_capacity == 0 {
            return Err(EngineError::Config(
                "store.batch_size and store.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl ScheduleConfig {
    pub fn start_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.start_time, "%H:%M").map_err(|e| {
            EngineError::Config(format!("schedule.start_time '{}': {e}", self.start_time))
        })
    }

    pub fn interval(&self) -> Option<chrono::Duration> {
        if self.interval_hours == 0 {
            None
        } else {
            Some(chrono::Duration::hours(self.interval_hours as i64))
        }
    }
}

impl StoreConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_millis.max(1))
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [backup]
            parallelism = 4
            backup_dir = "/srv/backups"

            [schedule]
            start_time = "03:30"
            default_mode = "incremental"
            "#,
        )
        .unwrap();

        assert_eq!(config.backup.parallelism, 4);
        assert_eq!(config.backup.backup_dir, PathBuf::from("/srv/backups"));
        assert!(config.backup.compress);
        assert_eq!(config.schedule.default_mode, BackupMode::Incremental);
        assert_eq!(config.schedule.interval_hours, 24);
        assert_eq!(config.admission.service_names, vec!["mysql", "mysqld", "mariadb"]);
        assert_eq!(config.admission.restart_window_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_parallelism() {
        let mut config = AppConfig::default();
        config.backup.parallelism = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_threshold_and_start_time() {
        let mut config = AppConfig::default();
        config.admission.memory_threshold_percent = 120.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.schedule.start_time = "25:99".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_bounds_schedule_and_retention_spans() {
        let mut config = AppConfig::default();
        config.schedule.interval_hours = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.schedule.interval_hours = MAX_INTERVAL_HOURS;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.schedule.full_interval_days = i64::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retention.retention_days = MAX_DAYS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_disables_schedule() {
        let mut schedule = ScheduleConfig::default();
        schedule.interval_hours = 0;
        assert!(schedule.interval().is_none());
    }
}
