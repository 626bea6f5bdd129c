use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::collector::{self, CollectError};
use crate::crawler::registry::Admission;
use crate::crawler::task::{CrawlRequest, Job, PausedTask, TaskResult, TaskRuntime};
use crate::crawler::worker::{WorkContext, WorkerPool};
use crate::fetch::Fetcher;
use crate::storage::queue::{self, JobQueue, QueueError};
use crate::storage::sink::ResultSink;
use crate::utils::metrics::CrawlStats;

/// Faults that end a task without a result
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("job queue fault: {0}")]
    Queue(#[from] QueueError),

    #[error("cannot prepare record file {path}: {source}")]
    RecordFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// No work left, result handed off
    Finished(TaskResult),

    /// Aborted, state saved for a later resume
    Paused(TaskResult),
}

enum Terminal {
    Finished,
    Paused,
}

/// Drives one crawl task from start to a terminal state
pub struct TaskController {
    config: Arc<CrawlerConfig>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn ResultSink>,
    stats: Arc<CrawlStats>,
}

impl TaskController {
    pub fn new(
        config: Arc<CrawlerConfig>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn ResultSink>,
        stats: Arc<CrawlStats>,
    ) -> Self {
        Self { config, fetcher, sink, stats }
    }

    /// Crawl `request` until it finishes or is aborted
    ///
    /// The admission is held for the whole run and dropped on return, which
    /// unregisters the site whatever the outcome.
    pub async fn run(&self, request: CrawlRequest, mut admission: Admission) -> Result<TaskOutcome, TaskError> {
        let mut runtime = TaskRuntime::new(request, admission.abort_flag());
        let website_id = runtime.website_id();
        let queue_path = self.config.storage.queue_path(website_id);
        let record_path = self.config.storage.record_path(website_id);

        info!(website_id, url = %runtime.base_url, "Starting crawler");

        // Fresh run, earlier queues and records are never picked up
        queue::discard(&queue_path).await?;
        remove_record_file(&record_path)
            .await
            .map_err(|source| TaskError::RecordFile { path: record_path.clone(), source })?;

        let queue = Arc::new(JobQueue::open(&queue_path).await?);
        let record_file = match collector::open_record_file(&record_path).await {
            Ok(file) => file,
            Err(source) => {
                queue.close().await?;
                return Err(TaskError::RecordFile { path: record_path, source });
            }
        };

        let ctx = Arc::new(WorkContext {
            website_id,
            queue: queue.clone(),
            counters: runtime.counters.clone(),
            abort: runtime.abort.clone(),
            stats: self.stats.clone(),
            retries: self.config.crawler.retries,
            retry_delay: self.config.crawler.retry_delay(),
        });

        // Seed before any worker can look at the queue
        ctx.queue_job(Job::new(runtime.base_url.clone())).await?;
        self.stats.task_started();

        let (results_tx, results_rx) = mpsc::channel(self.config.crawler.results_buffer);
        let collector = collector::spawn(website_id, results_rx, record_file, record_path.clone());
        let pool = WorkerPool::spawn(
            ctx.clone(),
            self.fetcher.clone(),
            results_tx.clone(),
            self.config.crawler.workers,
        );

        let terminal = self.supervise(&runtime).await;

        // Finished: workers are idle in `pop`. Paused: they finish their job first.
        pool.stop();
        pool.join().await;
        drop(results_tx);

        match terminal {
            Terminal::Finished => {
                let closed = queue.close().await;
                runtime.result.finalize(&runtime.counters);
                admission.release_slot();
                closed?;

                self.stats.task_finished();
                info!(
                    website_id,
                    url = %runtime.base_url,
                    duration = ?runtime.result.duration().to_std().unwrap_or_default(),
                    files = runtime.result.file_count,
                    errors = runtime.result.error_count,
                    status = %runtime.result.status_code.map_or("unknown", |code| code.as_str()),
                    "Crawler finished"
                );

                self.handoff(&runtime.result, collector, &record_path).await;
                Ok(TaskOutcome::Finished(runtime.result))
            }
            Terminal::Paused => {
                // Everything found so far must be on disk before the state is saved
                if let Err(e) = wait_collector(collector).await {
                    warn!(website_id, "Paused with incomplete records: {}", e);
                }

                let closed = queue.close().await;
                runtime.result.stamp_end(&runtime.counters);
                admission.release_slot();
                closed?;

                self.stats.task_paused();
                self.save_paused(&runtime, queue_path, record_path).await;
                Ok(TaskOutcome::Paused(runtime.result))
            }
        }
    }

    /// Poll until no work is left or an abort was requested
    async fn supervise(&self, runtime: &TaskRuntime) -> Terminal {
        let mut ticker = tokio::time::interval(self.config.scheduler.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Completion wins over a simultaneous abort
            if runtime.counters.in_progress() == 0 {
                return Terminal::Finished;
            }
            if runtime.abort.is_set() {
                return Terminal::Paused;
            }
        }
    }

    /// Upload a finished result, then drop the record file
    async fn handoff(
        &self,
        result: &TaskResult,
        collector: JoinHandle<Result<u64, CollectError>>,
        record_path: &Path,
    ) {
        let website_id = result.website_id;

        match wait_collector(collector).await {
            Ok(_) => {
                if let Err(e) = self.sink.push_result(result, record_path).await {
                    error!(website_id, "Failed uploading crawl results: {:#}", e);
                }
            }
            Err(e) => error!(website_id, "Failed saving crawl results: {}", e),
        }

        if let Err(e) = remove_record_file(record_path).await {
            warn!(website_id, "Failed to remove {}: {}", record_path.display(), e);
        }
    }

    async fn save_paused(&self, runtime: &TaskRuntime, queue_path: PathBuf, record_path: PathBuf) {
        let website_id = runtime.website_id();
        let paused = PausedTask {
            website_id,
            base_url: runtime.base_url.clone(),
            result: runtime.result.clone(),
            queue_path,
            record_path,
            paused_at: Utc::now(),
        };

        match self.sink.save_task(&paused).await {
            Ok(()) => info!(
                website_id,
                url = %runtime.base_url,
                duration = ?runtime.result.duration().to_std().unwrap_or_default(),
                files = runtime.result.file_count,
                "Crawler paused"
            ),
            // The queue stays on disk but nothing points at it anymore
            Err(e) => error!(
                website_id,
                url = %runtime.base_url,
                "Failed to save crawler state: {:#}", e
            ),
        }
    }
}

async fn wait_collector(collector: JoinHandle<Result<u64, CollectError>>) -> Result<u64, String> {
    match collector.await {
        Ok(Ok(written)) => Ok(written),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("collector task failed: {}", e)),
    }
}

async fn remove_record_file(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
