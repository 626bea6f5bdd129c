use anyhow::{Result, Context};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::{CrawlRequest, Registry, Scheduler, Task};
use crate::fetch::HttpFetcher;
use crate::storage::{LocalSink, PausedStore, RemoteSink, ResultSink};

/// Crawl every URL as its own task, numbering sites from `first_id`
pub async fn crawl(config: CrawlerConfig, urls: Vec<String>, first_id: u64) -> Result<()> {
    let config = Arc::new(config);

    // Reject bad input before anything starts
    let requests = urls
        .iter()
        .zip(first_id..)
        .map(|(url, website_id)| {
            CrawlRequest::new(Task { website_id, url: url.clone() })
                .context(format!("Invalid URL: {}", url))
        })
        .collect::<Result<Vec<_>>>()?;

    let fetcher = Arc::new(HttpFetcher::new(&config.crawler)?);
    let sink = result_sink(&config)?;
    let registry = Arc::new(Registry::new());
    let scheduler = Scheduler::new(config.clone(), registry.clone(), fetcher, sink);

    let (tx, rx) = mpsc::channel(requests.len().max(1));
    for request in requests {
        tx.send(request).await.context("Failed to submit crawl task")?;
    }
    drop(tx);

    // Ctrl-C pauses running tasks and stops intake
    let shutdown = CancellationToken::new();
    let interrupt = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let paused = registry.abort_all();
                warn!("Interrupted, pausing {} running tasks", paused);
                shutdown.cancel();
            }
        })
    };

    scheduler.run(rx, shutdown).await;
    scheduler.wait().await;
    interrupt.abort();

    let stats = scheduler.stats().snapshot();
    info!(
        finished = stats.tasks_finished,
        paused = stats.tasks_paused,
        failed = stats.tasks_failed,
        "All crawl tasks done"
    );

    println!("Tasks finished: {}", stats.tasks_finished);
    println!("Tasks paused:   {}", stats.tasks_paused);
    println!("Tasks failed:   {}", stats.tasks_failed);
    println!("Files found:    {}", stats.files);
    println!("Listing errors: {}", stats.errors);

    Ok(())
}

fn result_sink(config: &CrawlerConfig) -> Result<Arc<dyn ResultSink>> {
    let paused = PausedStore::new(config.storage.paused_dir.clone());

    if config.server.enabled {
        info!("Uploading results to {}", config.server.url);
        let sink = RemoteSink::new(&config.server, paused)
            .context("Failed to set up result upload")?;
        Ok(Arc::new(sink))
    } else {
        info!("Saving results to {}", config.storage.output_dir.display());
        Ok(Arc::new(LocalSink::new(config.storage.output_dir.clone(), paused)))
    }
}

/// List paused tasks
pub async fn paused(config: &CrawlerConfig) -> Result<()> {
    let tasks = PausedStore::new(config.storage.paused_dir.clone())
        .list()
        .await?;

    if tasks.is_empty() {
        println!("No paused tasks");
        return Ok(());
    }

    println!("Paused tasks:");
    for task in tasks {
        println!(
            "  - {} {} ({} files, {} errors, paused {})",
            task.website_id,
            task.base_url,
            task.result.file_count,
            task.result.error_count,
            task.paused_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show the saved state of one paused task
pub async fn show_paused(config: &CrawlerConfig, website_id: u64) -> Result<()> {
    let store = PausedStore::new(config.storage.paused_dir.clone());
    let Some(task) = store.load(website_id).await? else {
        anyhow::bail!("No paused task for site {}", website_id);
    };

    let contents = serde_json::to_string_pretty(&task)
        .context("Failed to serialize paused task")?;
    println!("{}", contents);

    Ok(())
}

/// Show the effective configuration
pub async fn show_config(config: &CrawlerConfig) -> Result<()> {
    let contents = serde_yaml::to_string(config)
        .context("Failed to serialize configuration")?;

    println!("Current configuration:");
    println!("{}", contents);

    Ok(())
}

/// Write the built-in defaults to `path`, or to the default location
pub async fn init_config(path: Option<&Path>) -> Result<()> {
    let config = CrawlerConfig::default();
    let path = path.map(Path::to_path_buf).unwrap_or_else(CrawlerConfig::default_path);

    if path.exists() {
        warn!("Overwriting existing configuration: {}", path.display());
    }
    config.save_to_file(&path)?;
    println!("Wrote default configuration to {}", path.display());

    Ok(())
}
