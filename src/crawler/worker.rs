use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::crawler::task::{AbortFlag, File, Job, TaskCounters, WebsiteId};
use crate::fetch::Fetcher;
use crate::storage::queue::{JobQueue, QueueError};
use crate::utils::metrics::CrawlStats;

/// Longest pause before retrying a job
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Everything the workers of one task share
pub struct WorkContext {
    pub website_id: WebsiteId,
    pub queue: Arc<JobQueue>,
    pub counters: Arc<TaskCounters>,
    pub abort: AbortFlag,
    pub stats: Arc<CrawlStats>,

    /// Failed attempts allowed before a job counts as an error
    pub retries: u32,

    /// Base delay of the retry backoff
    pub retry_delay: Duration,
}

impl WorkContext {
    /// Enqueue a job and count it as in progress
    pub async fn queue_job(&self, job: Job) -> Result<(), QueueError> {
        self.counters.job_queued();
        if let Err(e) = self.queue.push(job).await {
            self.counters.job_done();
            return Err(e);
        }
        self.stats.job_queued();
        Ok(())
    }

    fn backoff(&self, fails: u32) -> Duration {
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(fails))
            .min(MAX_RETRY_DELAY);
        let jitter_ms = (self.retry_delay.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

/// Fixed set of fetch workers bound to one task
pub struct WorkerPool {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` workers consuming the context's queue
    pub fn spawn(
        ctx: Arc<WorkContext>,
        fetcher: Arc<dyn Fetcher>,
        results: mpsc::Sender<File>,
        workers: usize,
    ) -> Self {
        let stop = CancellationToken::new();

        let handles = (0..workers)
            .map(|id| {
                let ctx = ctx.clone();
                let fetcher = fetcher.clone();
                let results = results.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    run_worker(id, ctx, fetcher, results, stop).await;
                })
            })
            .collect();

        Self { stop, handles }
    }

    /// Ask idle workers to exit; busy ones finish their current job first
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for outcome in futures::future::join_all(self.handles).await {
            if let Err(e) = outcome {
                error!("Worker terminated abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    id: usize,
    ctx: Arc<WorkContext>,
    fetcher: Arc<dyn Fetcher>,
    results: mpsc::Sender<File>,
    stop: CancellationToken,
) {
    debug!(website_id = ctx.website_id, "Worker {} started", id);

    loop {
        if ctx.abort.is_set() {
            break;
        }

        let Some(job) = ctx.queue.pop(&stop).await else {
            break;
        };

        handle_job(&ctx, fetcher.as_ref(), &results, job).await;
        ctx.counters.job_done();
    }

    debug!(website_id = ctx.website_id, "Worker {} stopped", id);
}

async fn handle_job(ctx: &WorkContext, fetcher: &dyn Fetcher, results: &mpsc::Sender<File>, job: Job) {
    match fetcher.fetch(&job).await {
        Ok(listing) => {
            for dir in listing.dirs {
                if let Err(e) = ctx.queue_job(Job::new(dir)).await {
                    warn!(website_id = ctx.website_id, "Failed to queue sub-directory: {}", e);
                }
            }

            for file in listing.files {
                if results.send(file).await.is_err() {
                    warn!(website_id = ctx.website_id, "Results stream closed, dropping files of {}", job.url_str);
                    break;
                }
                ctx.counters.add_file();
                ctx.stats.add_file();
            }
        }
        Err(e) if e.is_retryable() && job.fails < ctx.retries => {
            let delay = ctx.backoff(job.fails);
            debug!(
                website_id = ctx.website_id,
                attempt = job.fails + 1,
                "Retrying {} in {:?}: {}", job.url_str, delay, e
            );
            tokio::time::sleep(delay).await;

            if let Err(e) = ctx.queue_job(job.retried()).await {
                warn!(website_id = ctx.website_id, "Failed to requeue {}: {}", job.url_str, e);
                ctx.counters.add_error();
                ctx.stats.add_error();
            }
        }
        Err(e) => {
            debug!(website_id = ctx.website_id, "Giving up on {}: {}", job.url_str, e);
            ctx.counters.add_error();
            ctx.stats.add_error();
        }
    }
}
