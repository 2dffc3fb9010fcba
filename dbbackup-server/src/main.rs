//! dbbackup-server - main entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbbackup_server::config::AppConfig;
use dbbackup_server::daemon::shutdown::ShutdownCoordinator;
use dbbackup_server::db::connection::{close_pool, create_pool};
use dbbackup_server::db::migrate::migrate;
use dbbackup_server::models::summary::{BackupMode, Summary, SummaryState};
use dbbackup_server::notify::{ChangeNotifier, LogNotifier, SummaryNotifier, WebhookNotifier};
use dbbackup_server::services::admission::{SysinfoSampler, SystemdService};
use dbbackup_server::services::engine::BackupEngine;
use dbbackup_server::services::tools::{DatabaseTools, MysqlTools};
use dbbackup_server::state::AppState;
use dbbackup_server::store::Store;
use dbbackup_server::utils;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until SIGINT/SIGTERM (default)
    Serve,
    /// Full backup of the given databases (all user databases when none), then exit
    Full { databases: Vec<String> },
    /// Incremental backup from each database's latest artifact, then exit
    Incremental { databases: Vec<String> },
    /// Full or incremental per database depending on the age of its last full
    Auto { databases: Vec<String> },
    /// Re-run the failed units of a completed request
    Retry { job_group_id: String },
    /// Print active jobs and recent requests as JSON
    Status {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Print the backup chains of a database as JSON
    Chains { database: String },
    /// Delete backup chains past retention
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env(),
    };
    config.validate()?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backup_dir = %config.backup.backup_dir.display(),
        parallelism = config.backup.parallelism,
        "Starting dbbackup-server"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let pool = create_pool(
        &config.db_path().to_string_lossy(),
        Duration::from_millis(config.store.busy_timeout_millis),
    )?;
    migrate(&pool)?;

    let store = Store::new(pool.clone(), &config.store, ChangeNotifier::new());
    let tools: Arc<dyn DatabaseTools> = Arc::new(MysqlTools::new(config.mysql.clone(), config.backup.clone()));
    let service = Arc::new(SystemdService::new(config.admission.service_names.clone(), tools.clone()));
    let notifier: Arc<dyn SummaryNotifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };
    let engine = BackupEngine::new(AppState::new(
        config,
        store,
        tools,
        Arc::new(SysinfoSampler::new()),
        service,
        notifier,
    ));

    let shutdown = ShutdownCoordinator::new();
    let outcome = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&engine, &shutdown).await,
        Command::Full { databases } => run_once(&engine, &shutdown, BackupMode::Full, databases).await,
        Command::Incremental { databases } => run_once(&engine, &shutdown, BackupMode::Incremental, databases).await,
        Command::Auto { databases } => run_once(&engine, &shutdown, BackupMode::Auto, databases).await,
        Command::Retry { job_group_id } => {
            engine.retry(&job_group_id).await?;
            finish(&engine, &shutdown, &job_group_id).await
        }
        Command::Status { limit } => status(&engine, limit).await,
        Command::Chains { database } => {
            let chains = engine.chains(&database).await?;
            println!("{}", serde_json::to_string_pretty(&chains)?);
            Ok(())
        }
        Command::Cleanup => {
            let report = engine.cleanup_retention().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    };

    engine.state().store.flush().await;
    close_pool(&pool);
    outcome
}

async fn serve(engine: &BackupEngine, shutdown: &ShutdownCoordinator) -> Result<()> {
    engine.recover_interrupted().await?;
    if !engine.start_scheduler().await? {
        tracing::warn!("Scheduler disabled, waiting for shutdown");
    }

    shutdown.wait_for_signal().await;
    shutdown.shutdown(engine).await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn run_once(
    engine: &BackupEngine,
    shutdown: &ShutdownCoordinator,
    mode: BackupMode,
    databases: Vec<String>,
) -> Result<()> {
    let group = engine.start(mode, databases).await?;
    finish(engine, shutdown, &group).await
}

/// Wait for the request (or a signal), print its summary and fail when any
/// unit failed or the request was cancelled.
async fn finish(engine: &BackupEngine, shutdown: &ShutdownCoordinator, group: &str) -> Result<()> {
    let summary: Summary = tokio::select! {
        summary = engine.wait(group) => summary?,
        _ = shutdown.wait_for_signal() => {
            shutdown.shutdown(engine).await;
            engine.summary(group).await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.state != SummaryState::Completed {
        anyhow::bail!("Backup request {group} was {}", summary.state);
    }
    if summary.total_failed > 0 {
        anyhow::bail!("{} of {} units failed", summary.total_failed, summary.requested_count);
    }
    Ok(())
}

/// The scheduler lives in the serving process, so a one-shot status only
/// reports what the store knows.
async fn status(engine: &BackupEngine, limit: i64) -> Result<()> {
    let snapshot = engine.snapshot(limit).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
