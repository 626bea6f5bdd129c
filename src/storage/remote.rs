use anyhow::{Result, Context};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::cli::config::ServerSettings;
use crate::crawler::task::{PausedTask, TaskResult};
use crate::storage::paused::PausedStore;
use crate::storage::sink::ResultSink;

/// Uploads finished crawls to the result server
pub struct RemoteSink {
    client: Client,
    base_url: String,
    token: Option<String>,
    paused: PausedStore,
}

impl RemoteSink {
    pub fn new(settings: &ServerSettings, paused: PausedStore) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            paused,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ResultSink for RemoteSink {
    async fn push_result(&self, result: &TaskResult, records: &Path) -> Result<()> {
        let file = tokio::fs::File::open(records)
            .await
            .context(format!("Failed to open crawl results: {}", records.display()))?;
        let size = file.metadata().await?.len();

        // Stream the record file, it can be arbitrarily large
        let upload_url = format!("{}/task/upload/{}", self.base_url, result.website_id);
        debug!("Uploading {} bytes to {}", size, upload_url);

        self.authorized(self.client.post(&upload_url))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .context("Failed to send crawl results")?
            .error_for_status()
            .context("Result server rejected crawl results")?;

        let complete_url = format!("{}/task/complete", self.base_url);
        self.authorized(self.client.post(&complete_url))
            .json(result)
            .send()
            .await
            .context("Failed to send task result")?
            .error_for_status()
            .context("Result server rejected task result")?;

        info!(website_id = result.website_id, "Uploaded crawl results");

        Ok(())
    }

    async fn save_task(&self, task: &PausedTask) -> Result<()> {
        self.paused.save(task).await?;
        Ok(())
    }
}
