use crate::config::AppConfig;
use crate::notify::SummaryNotifier;
use crate::services::admission::{AdmissionController, MemorySampler, ServiceControl};
use crate::services::context::RunContext;
use crate::services::scheduler::Scheduler;
use crate::services::tools::DatabaseTools;
use crate::services::worker_pool::UnitRunner;
use crate::store::Store;
use dashmap::DashMap;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub tools: Arc<dyn DatabaseTools>,
    pub runner: Arc<UnitRunner>,
    pub notifier: Arc<dyn SummaryNotifier>,
    pub scheduler: Scheduler,
    /// Contexts of requests whose workers are still running, by job group id
    pub runs: DashMap<String, Arc<RunContext>>,
    /// Databases claimed by a live request, mapped to its job group id
    pub claims: DashMap<String, String>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Store,
        tools: Arc<dyn DatabaseTools>,
        sampler: Arc<dyn MemorySampler>,
        service: Arc<dyn ServiceControl>,
        notifier: Arc<dyn SummaryNotifier>,
    ) -> Self {
        let admission = Arc::new(AdmissionController::from_config(&config.admission, sampler, service));
        let runner = Arc::new(UnitRunner {
            store: store.clone(),
            tools: tools.clone(),
            admission,
            backup_dir: config.backup.backup_dir.clone(),
            compress: config.backup.compress,
            optimize_tables: config.backup.optimize_tables,
        });
        Self {
            scheduler: Scheduler::new(config.schedule.clone()),
            config,
            store,
            tools,
            runner,
            notifier,
            runs: DashMap::new(),
            claims: DashMap::new(),
        }
    }
}
