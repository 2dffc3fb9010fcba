use crate::models::summary::Summary;
use async_trait::async_trait;
use std::time::Duration;

/// Receives every finalized summary.
#[async_trait]
pub trait SummaryNotifier: Send + Sync {
    async fn notify(&self, summary: &Summary) -> anyhow::Result<()>;
}

/// Logs the summary and nothing else.
pub struct LogNotifier;

#[async_trait]
impl SummaryNotifier for LogNotifier {
    async fn notify(&self, summary: &Summary) -> anyhow::Result<()> {
        tracing::info!(
            group_id = %summary.job_group_id,
            state = %summary.state,
            mode = %summary.mode,
            full = summary.total_full,
            incremental = summary.total_incremental,
            failed = summary.total_failed,
            bytes = summary.total_bytes,
            restart_seconds = summary.restart_seconds,
            "Backup request finished"
        );
        Ok(())
    }
}

/// Posts the summary as JSON to a webhook (e.g. a chat integration that
/// formats it).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SummaryNotifier for WebhookNotifier {
    async fn notify(&self, summary: &Summary) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(summary).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned HTTP {}", response.status());
        }
        tracing::debug!(group_id = %summary.job_group_id, "Summary delivered to webhook");
        Ok(())
    }
}
