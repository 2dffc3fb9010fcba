//! External database tooling: metadata queries, table optimization and the
//! dump processes themselves.

use crate::config::{BackupConfig, MysqlConfig};
use crate::error::{EngineError, UnitError};
use crate::services::chain::side_log_path;
use crate::services::progress::ProgressSource;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::watch;

/// Schemas that belong to the server itself and are never backed up unless
/// named explicitly.
pub const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

const DATETIME_ARG_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone)]
pub struct DumpTarget {
    pub database: String,
    pub output: PathBuf,
    pub compress: bool,
}

/// Binlog window of an incremental, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpOutcome {
    /// Bytes produced by the tool
    pub bytes: u64,
    /// Size of the artifact on disk
    pub disk_bytes: u64,
}

#[async_trait]
pub trait DatabaseTools: Send + Sync {
    /// Check that every binary a run needs is available.
    async fn preflight(&self) -> crate::error::Result<()>;

    async fn list_databases(&self) -> anyhow::Result<Vec<String>>;

    async fn table_count(&self, database: &str) -> anyhow::Result<u64>;

    /// Data plus index size in bytes, when the server reports it.
    async fn database_size(&self, database: &str) -> anyhow::Result<Option<i64>>;

    /// Global binary log format (`ROW`, `STATEMENT`, `MIXED`).
    async fn binlog_format(&self) -> anyhow::Result<String>;

    async fn optimize(&self, database: &str) -> Result<(), UnitError>;

    async fn dump_full(
        &self,
        target: &DumpTarget,
        progress: Box<dyn ProgressSource>,
        report: watch::Sender<i64>,
    ) -> Result<DumpOutcome, UnitError>;

    async fn dump_incremental(
        &self,
        target: &DumpTarget,
        window: Window,
        progress: Box<dyn ProgressSource>,
        report: watch::Sender<i64>,
    ) -> Result<DumpOutcome, UnitError>;

    /// True when the server answers.
    async fn ping(&self) -> bool;
}

/// Which output stream of the dump tool drives progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressFeed {
    Stdout,
    Stderr,
}

pub struct MysqlTools {
    mysql: MysqlConfig,
    backup: BackupConfig,
}

impl MysqlTools {
    pub fn new(mysql: MysqlConfig, backup: BackupConfig) -> Self {
        Self { mysql, backup }
    }

    /// Base command with connection options; dump tools run under `nice` when
    /// a level is configured.
    fn command(&self, program: &Path, niced: bool) -> Command {
        let mut cmd = match self.backup.nice_level.filter(|_| niced) {
            Some(level) => {
                let mut cmd = Command::new("nice");
                cmd.arg("-n").arg(level.to_string()).arg(program);
                cmd
            }
            None => Command::new(program),
        };
        match &self.mysql.socket {
            Some(socket) => {
                cmd.arg(format!("--socket={}", socket.display()));
            }
            None => {
                cmd.arg(format!("--host={}", self.mysql.host))
                    .arg(format!("--port={}", self.mysql.port));
            }
        }
        cmd.arg(format!("--user={}", self.mysql.user));
        if !self.mysql.password.is_empty() {
            cmd.env("MYSQL_PWD", &self.mysql.password);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    async fn query(&self, sql: &str) -> anyhow::Result<Vec<Vec<String>>> {
        let output = self
            .command(&self.backup.binaries.mysql, false)
            .args(["--batch", "--skip-column-names", "-e", sql])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("mysql query failed ({}): {}", output.status, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.split('\t').map(str::to_string).collect())
            .collect())
    }

    async fn scalar(&self, sql: &str) -> anyhow::Result<String> {
        self.query(sql)
            .await?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .ok_or_else(|| anyhow::anyhow!("query returned no rows: {sql}"))
    }

    async fn binary_logs(&self) -> anyhow::Result<Vec<String>> {
        let rows = self.query("SHOW BINARY LOGS").await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn write_error(path: &Path, e: std::io::Error) -> UnitError {
    UnitError::Write(format!("{}: {e}", path.display()))
}

/// Run a dump process, streaming stdout into the artifact and stderr into the
/// side log.
async fn stream_to_artifact(
    cmd: &mut Command,
    tool: &str,
    target: &DumpTarget,
    progress: Box<dyn ProgressSource>,
    report: watch::Sender<i64>,
    feed: ProgressFeed,
) -> Result<DumpOutcome, UnitError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let file = tokio::fs::File::create(&target.output)
        .await
        .map_err(|e| write_error(&target.output, e))?;
    let mut out: Box<dyn AsyncWrite + Unpin + Send> = if target.compress {
        Box::new(GzipEncoder::new(BufWriter::new(file)))
    } else {
        Box::new(BufWriter::new(file))
    };
    let log_path = side_log_path(&target.output);
    let log_file = tokio::fs::File::create(&log_path)
        .await
        .map_err(|e| write_error(&log_path, e))?;

    let mut child = cmd
        .spawn()
        .map_err(|e| UnitError::Process(format!("cannot start {tool}: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| UnitError::Process(format!("{tool} stdout unavailable")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| UnitError::Process(format!("{tool} stderr unavailable")))?;

    let report = Arc::new(report);
    let (mut stdout_progress, stderr_progress) = match feed {
        ProgressFeed::Stdout => (Some(progress), None),
        ProgressFeed::Stderr => (None, Some(progress)),
    };

    // stderr: verbatim copy into the side log, last non-empty line kept for the error text
    let stderr_report = report.clone();
    let stderr_task = tokio::spawn(async move {
        let mut progress = stderr_progress;
        let mut log = BufWriter::new(log_file);
        let mut reader = BufReader::new(stderr);
        let mut raw = Vec::new();
        let mut last = String::new();
        let mut log_error: Option<std::io::Error> = None;
        // Tool output is not guaranteed UTF-8; keep draining the pipe regardless
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot read tool stderr");
                    break;
                }
            }
            if log_error.is_none() {
                log_error = log.write_all(&raw).await.err();
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(pct) = progress.as_mut().and_then(|p| p.observe(line)) {
                let _ = stderr_report.send(pct);
            }
            if !line.trim().is_empty() {
                last = line.to_string();
            }
        }
        if log_error.is_none() {
            log_error = log.flush().await.err();
        }
        (last, log_error)
    });

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut bytes = 0u64;
    loop {
        buf.clear();
        let n = match reader.read_until(b'\n', &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                stderr_task.abort();
                return Err(UnitError::Process(format!("reading {tool} output: {e}")));
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = out.write_all(&buf).await {
            stderr_task.abort();
            let _ = child.kill().await;
            return Err(write_error(&target.output, e));
        }
        bytes += n as u64;
        if let Some(pct) = stdout_progress
            .as_mut()
            .and_then(|p| p.observe(&String::from_utf8_lossy(&buf)))
        {
            let _ = report.send(pct);
        }
    }
    // Finishes the gzip trailer as well
    if let Err(e) = out.shutdown().await {
        stderr_task.abort();
        return Err(write_error(&target.output, e));
    }

    let status = child
        .wait()
        .await
        .map_err(|e| UnitError::Process(format!("waiting for {tool}: {e}")))?;
    let (last_line, log_error) = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let detail = if last_line.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {last_line}")
        };
        return Err(UnitError::Process(format!("{tool} {detail}")));
    }
    if let Some(e) = log_error {
        return Err(write_error(&log_path, e));
    }

    let disk_bytes = tokio::fs::metadata(&target.output)
        .await
        .map_err(|e| write_error(&target.output, e))?
        .len();
    Ok(DumpOutcome { bytes, disk_bytes })
}

#[async_trait]
impl DatabaseTools for MysqlTools {
    async fn preflight(&self) -> crate::error::Result<()> {
        let bins = &self.backup.binaries;
        let mut required: Vec<&Path> = vec![
            bins.mysqldump.as_path(),
            bins.mysqlbinlog.as_path(),
            bins.mysql.as_path(),
            bins.mysqlcheck.as_path(),
            bins.mysqladmin.as_path(),
        ];
        if self.backup.nice_level.is_some() {
            required.push(Path::new("nice"));
        }
        for bin in required {
            which::which(bin)
                .map_err(|e| EngineError::Config(format!("{} not usable: {e}", bin.display())))?;
        }
        tokio::fs::create_dir_all(&self.backup.backup_dir).await.map_err(|e| {
            EngineError::Config(format!(
                "backup directory {} not writable: {e}",
                self.backup.backup_dir.display()
            ))
        })?;
        Ok(())
    }

    async fn list_databases(&self) -> anyhow::Result<Vec<String>> {
        let rows = self.query("SHOW DATABASES").await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }

    async fn table_count(&self, database: &str) -> anyhow::Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = {}",
            sql_literal(database)
        );
        Ok(self.scalar(&sql).await?.trim().parse()?)
    }

    async fn database_size(&self, database: &str) -> anyhow::Result<Option<i64>> {
        let sql = format!(
            "SELECT COALESCE(SUM(data_length + index_length), 0) FROM information_schema.tables WHERE table_schema = {}",
            sql_literal(database)
        );
        Ok(self.scalar(&sql).await?.trim().parse().ok())
    }

    async fn binlog_format(&self) -> anyhow::Result<String> {
        Ok(self.scalar("SELECT @@GLOBAL.binlog_format").await?.trim().to_uppercase())
    }

    async fn optimize(&self, database: &str) -> Result<(), UnitError> {
        let output = self
            .command(&self.backup.binaries.mysqlcheck, true)
            .args(["--optimize", "--databases", database])
            .output()
            .await
            .map_err(|e| UnitError::Optimize(format!("cannot start mysqlcheck: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default();
        Err(UnitError::Optimize(format!("mysqlcheck {}: {}", output.status, last.trim())))
    }

    async fn dump_full(
        &self,
        target: &DumpTarget,
        progress: Box<dyn ProgressSource>,
        report: watch::Sender<i64>,
    ) -> Result<DumpOutcome, UnitError> {
        let mut cmd = self.command(&self.backup.binaries.mysqldump, true);
        cmd.args([
            "--single-transaction",
            "--routines",
            "--triggers",
            "--events",
            "--verbose",
            "--databases",
        ])
        .arg(&target.database);
        stream_to_artifact(&mut cmd, "mysqldump", target, progress, report, ProgressFeed::Stderr).await
    }

    async fn dump_incremental(
        &self,
        target: &DumpTarget,
        window: Window,
        progress: Box<dyn ProgressSource>,
        report: watch::Sender<i64>,
    ) -> Result<DumpOutcome, UnitError> {
        let logs = self
            .binary_logs()
            .await
            .map_err(|e| UnitError::Process(format!("cannot list binary logs: {e}")))?;
        if logs.is_empty() {
            return Err(UnitError::Process("binary logging is disabled on the server".into()));
        }

        let mut cmd = self.command(&self.backup.binaries.mysqlbinlog, true);
        cmd.arg("--read-from-remote-server")
            .arg(format!("--database={}", target.database))
            .arg(format!("--start-datetime={}", window.start.format(DATETIME_ARG_FORMAT)))
            .arg(format!("--stop-datetime={}", window.stop.format(DATETIME_ARG_FORMAT)))
            .args(&logs);
        stream_to_artifact(&mut cmd, "mysqlbinlog", target, progress, report, ProgressFeed::Stdout).await
    }

    async fn ping(&self) -> bool {
        self.command(&self.backup.binaries.mysqladmin, false)
            .arg("ping")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
