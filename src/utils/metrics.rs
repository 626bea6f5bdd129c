use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::crawler::registry::Registry;

/// Process-wide crawl totals
#[derive(Debug, Default)]
pub struct CrawlStats {
    tasks_started: AtomicU64,
    tasks_finished: AtomicU64,
    tasks_paused: AtomicU64,
    tasks_failed: AtomicU64,
    files: AtomicU64,
    errors: AtomicU64,
    jobs_queued: AtomicU64,
}

/// Point-in-time copy of the totals
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tasks_started: u64,
    pub tasks_finished: u64,
    pub tasks_paused: u64,
    pub tasks_failed: u64,
    pub files: u64,
    pub errors: u64,
    pub jobs_queued: u64,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.tasks_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_paused(&self) {
        self.tasks_paused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_queued(&self) {
        self.jobs_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_finished: self.tasks_finished.load(Ordering::Relaxed),
            tasks_paused: self.tasks_paused.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
        }
    }
}

/// Periodically logs crawl progress
pub struct StatsReporter {
    stats: Arc<CrawlStats>,
    registry: Arc<Registry>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(stats: Arc<CrawlStats>, registry: Arc<Registry>, interval: Duration) -> Self {
        Self { stats, registry, interval }
    }

    /// Run until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;

            let mut last = self.stats.snapshot();
            let mut last_at = Instant::now();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = self.stats.snapshot();
                let active = self.registry.active_tasks();
                if active == 0 && now == last {
                    continue;
                }

                let elapsed = last_at.elapsed().as_secs_f64().max(f64::EPSILON);
                info!(
                    active_tasks = active,
                    files = now.files,
                    errors = now.errors,
                    jobs_queued = now.jobs_queued,
                    finished = now.tasks_finished,
                    paused = now.tasks_paused,
                    "Crawl stats: {:.1} files/s, {:.1} jobs/s",
                    files_per_second(&last, &now, elapsed),
                    now.jobs_queued.saturating_sub(last.jobs_queued) as f64 / elapsed,
                );

                last = now;
                last_at = Instant::now();
            }
        })
    }
}

fn files_per_second(before: &StatsSnapshot, after: &StatsSnapshot, elapsed_secs: f64) -> f64 {
    after.files.saturating_sub(before.files) as f64 / elapsed_secs
}
