use anyhow::{Result, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::crawler::task::{PausedTask, TaskResult};
use crate::storage::paused::PausedStore;

/// Destination of finished and paused crawls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Hand off a finished result together with its record file
    async fn push_result(&self, result: &TaskResult, records: &Path) -> Result<()>;

    /// Persist a paused task so it can be resumed later
    async fn save_task(&self, task: &PausedTask) -> Result<()>;
}

/// Keeps results in a local output directory
pub struct LocalSink {
    output_dir: PathBuf,
    paused: PausedStore,
}

impl LocalSink {
    pub fn new(output_dir: impl Into<PathBuf>, paused: PausedStore) -> Self {
        Self {
            output_dir: output_dir.into(),
            paused,
        }
    }
}

#[async_trait]
impl ResultSink for LocalSink {
    async fn push_result(&self, result: &TaskResult, records: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .context(format!("Failed to create output directory: {}", self.output_dir.display()))?;

        let records_out = self.output_dir.join(format!("{}.json", result.website_id));
        tokio::fs::copy(records, &records_out)
            .await
            .context(format!("Failed to copy {} to {}", records.display(), records_out.display()))?;

        let result_out = self.output_dir.join(format!("{}.result.json", result.website_id));
        let contents = serde_json::to_vec_pretty(result)
            .context("Failed to serialize task result")?;
        tokio::fs::write(&result_out, contents)
            .await
            .context(format!("Failed to write {}", result_out.display()))?;

        // A finished crawl supersedes any earlier pause
        self.paused.remove(result.website_id).await?;

        info!(
            website_id = result.website_id,
            "Results saved to {}",
            records_out.display()
        );

        Ok(())
    }

    async fn save_task(&self, task: &PausedTask) -> Result<()> {
        self.paused.save(task).await?;
        Ok(())
    }
}
