//! Memory-based admission control and database service restarts.

use crate::config::AdmissionConfig;
use crate::error::UnitError;
use crate::services::tools::DatabaseTools;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

pub trait MemorySampler: Send + Sync {
    /// Used memory in percent, or `None` when the host cannot be sampled.
    fn used_percent(&self) -> Option<f64>;
}

/// Host memory via `sysinfo`. Only Linux hosts are sampled.
pub struct SysinfoSampler {
    system: Mutex<sysinfo::System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    #[cfg(target_os = "linux")]
    fn used_percent(&self) -> Option<f64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(system.used_memory() as f64 * 100.0 / total as f64)
    }

    #[cfg(not(target_os = "linux"))]
    fn used_percent(&self) -> Option<f64> {
        None
    }
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Ask the service manager to restart the database. Returns the service
    /// name that accepted the request.
    async fn restart(&self) -> anyhow::Result<String>;

    async fn is_alive(&self) -> bool;
}

/// `systemctl restart <name>` for each known name, then `service <name>
/// restart`; liveness through the database tools' ping.
pub struct SystemdService {
    names: Vec<String>,
    tools: Arc<dyn DatabaseTools>,
}

impl SystemdService {
    pub fn new(names: Vec<String>, tools: Arc<dyn DatabaseTools>) -> Self {
        Self { names, tools }
    }

    async fn try_each(&self, program: &str, args_for: impl Fn(&str) -> Vec<String>) -> Option<String> {
        for name in &self.names {
            let output = Command::new(program).args(args_for(name)).output().await;
            match output {
                Ok(o) if o.status.success() => return Some(name.clone()),
                Ok(o) => {
                    tracing::debug!(
                        program,
                        service = %name,
                        status = %o.status,
                        stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                        "Restart attempt rejected"
                    );
                }
                Err(e) => tracing::debug!(program, service = %name, error = %e, "Restart attempt failed"),
            }
        }
        None
    }
}

#[async_trait]
impl ServiceControl for SystemdService {
    async fn restart(&self) -> anyhow::Result<String> {
        if let Some(name) = self
            .try_each("systemctl", |n| vec!["restart".to_string(), n.to_string()])
            .await
        {
            return Ok(name);
        }
        if let Some(name) = self
            .try_each("service", |n| vec![n.to_string(), "restart".to_string()])
            .await
        {
            return Ok(name);
        }
        anyhow::bail!("no service manager accepted a restart of {:?}", self.names)
    }

    async fn is_alive(&self) -> bool {
        self.tools.ping().await
    }
}

/// Gate that keeps new units from starting while memory is over threshold,
/// and runs the restart procedure for whichever worker coordinates it.
pub struct AdmissionController {
    sampler: Arc<dyn MemorySampler>,
    service: Arc<dyn ServiceControl>,
    threshold_percent: f64,
    poll_interval: Duration,
    restart_window: Duration,
    wait_interval: Duration,
}

impl AdmissionController {
    pub fn new(
        sampler: Arc<dyn MemorySampler>,
        service: Arc<dyn ServiceControl>,
        threshold_percent: f64,
        poll_interval: Duration,
        restart_window: Duration,
        wait_interval: Duration,
    ) -> Self {
        Self {
            sampler,
            service,
            threshold_percent,
            poll_interval,
            restart_window,
            wait_interval,
        }
    }

    pub fn from_config(config: &AdmissionConfig, sampler: Arc<dyn MemorySampler>, service: Arc<dyn ServiceControl>) -> Self {
        Self::new(
            sampler,
            service,
            config.memory_threshold_percent,
            Duration::from_secs(config.restart_poll_secs.max(1)),
            Duration::from_secs(config.restart_window_secs),
            Duration::from_millis(config.wait_poll_millis.max(1)),
        )
    }

    /// How long a worker sleeps between checks while a restart is running.
    pub fn wait_interval(&self) -> Duration {
        self.wait_interval
    }

    pub fn over_threshold(&self) -> bool {
        match self.sampler.used_percent() {
            Some(used) if used > self.threshold_percent => {
                tracing::warn!(
                    used_percent = used,
                    threshold = self.threshold_percent,
                    "Memory over threshold"
                );
                true
            }
            _ => false,
        }
    }

    /// Restart the service and poll liveness until it answers or the window
    /// runs out. Returns the time the restart took.
    pub async fn restart_and_wait(&self) -> Result<Duration, UnitError> {
        let started = Instant::now();
        match self.service.restart().await {
            Ok(name) => tracing::info!(service = %name, "Database service restart requested"),
            // Keep polling: the service may come back on its own
            Err(e) => tracing::error!(error = %e, "Database service restart failed"),
        }

        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.service.is_alive().await {
                let elapsed = started.elapsed();
                tracing::info!(seconds = elapsed.as_secs(), "Database service is back");
                return Ok(elapsed);
            }
            if started.elapsed() >= self.restart_window {
                tracing::error!(
                    window_secs = self.restart_window.as_secs(),
                    "Database service did not come back"
                );
                return Err(UnitError::RestartFailed(self.restart_window.as_secs()));
            }
        }
    }
}
