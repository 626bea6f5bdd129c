use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::controller::TaskController;
use crate::crawler::registry::Registry;
use crate::crawler::task::CrawlRequest;
use crate::fetch::Fetcher;
use crate::storage::sink::ResultSink;
use crate::utils::metrics::{CrawlStats, StatsReporter};

/// Admits crawl requests and runs them under the concurrency ceiling
pub struct Scheduler {
    /// Configuration shared with every task
    config: Arc<CrawlerConfig>,

    /// Sites currently admitted
    registry: Arc<Registry>,

    controller: Arc<TaskController>,

    stats: Arc<CrawlStats>,

    /// Running task lifecycles
    tracker: TaskTracker,

    /// Stops the stats reporter once every task is done
    reporter_stop: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: Arc<CrawlerConfig>,
        registry: Arc<Registry>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let stats = Arc::new(CrawlStats::new());
        let controller = Arc::new(TaskController::new(config.clone(), fetcher, sink, stats.clone()));

        Self {
            config,
            registry,
            controller,
            stats,
            tracker: TaskTracker::new(),
            reporter_stop: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> Arc<CrawlStats> {
        self.stats.clone()
    }

    /// Accept requests from `inbound` until it closes or `shutdown` fires
    ///
    /// Returning does not stop running tasks, use [`Scheduler::wait`] for that.
    pub async fn run(&self, mut inbound: mpsc::Receiver<CrawlRequest>, shutdown: CancellationToken) {
        let tasks = self.config.crawler.tasks;
        info!(
            tasks,
            workers = self.config.crawler.workers,
            "Scheduler started"
        );

        StatsReporter::new(self.stats.clone(), self.registry.clone(), self.config.stats.interval())
            .spawn(self.reporter_stop.clone());

        loop {
            // Hold further requests back while every slot is taken
            if !self.stall(tasks, &shutdown).await {
                break;
            }

            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = inbound.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            self.start(request);
        }

        info!(active_tasks = self.registry.active_tasks(), "Scheduler stopped accepting tasks");
    }

    /// Wait for every started task to reach a terminal state
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.reporter_stop.cancel();
    }

    /// Returns false if shutdown fired while waiting for a slot
    async fn stall(&self, tasks: usize, shutdown: &CancellationToken) -> bool {
        if self.registry.active_tasks() < tasks {
            return true;
        }

        debug!(active_tasks = self.registry.active_tasks(), "Task ceiling reached, waiting");
        while self.registry.active_tasks() >= tasks {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.scheduler.stall_interval()) => {}
            }
        }
        true
    }

    fn start(&self, request: CrawlRequest) {
        let website_id = request.website_id();
        let Some(admission) = self.registry.admit(website_id) else {
            warn!(website_id, url = %request.base_url, "Task already running, dropping request");
            return;
        };

        let controller = self.controller.clone();
        let stats = self.stats.clone();
        self.tracker.spawn(async move {
            if let Err(e) = controller.run(request, admission).await {
                stats.task_failed();
                error!(website_id, "Crawl task failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::Task;
    use crate::crawler::testing::{test_config, FakeFetcher};
    use crate::storage::paused::PausedStore;
    use crate::storage::sink::{LocalSink, MockResultSink};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn request(website_id: u64, url: &str) -> CrawlRequest {
        CrawlRequest::new(Task { website_id, url: url.to_string() }).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_request_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let fetcher = Arc::new(
            FakeFetcher::new()
                .with_delay(Duration::from_millis(50))
                .dir("http://od.test/", &["a.txt"], &[]),
        );

        let mut sink = MockResultSink::new();
        sink.expect_push_result()
            .times(1)
            .withf(|result, _| result.website_id == 7)
            .returning(|_, _| Ok(()));

        let registry = Arc::new(Registry::new());
        let scheduler = Scheduler::new(config, registry.clone(), fetcher.clone(), Arc::new(sink));
        let (tx, rx) = mpsc::channel(4);
        tx.send(request(7, "http://od.test/")).await.unwrap();
        tx.send(request(7, "http://od.test/")).await.unwrap();
        drop(tx);

        scheduler.run(rx, CancellationToken::new()).await;
        scheduler.wait().await;

        assert_eq!(fetcher.fetched(), 1);
        assert_eq!(scheduler.stats().snapshot().tasks_finished, 1);
        assert!(!registry.is_registered(7));
    }

    #[tokio::test]
    async fn test_active_tasks_stay_under_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));

        let mut fetcher = FakeFetcher::new().with_delay(Duration::from_millis(20));
        for id in 1..=5 {
            fetcher = fetcher.dir(&format!("http://site{}.test/", id), &["f.txt"], &[]);
        }

        let sink = LocalSink::new(
            config.storage.output_dir.clone(),
            PausedStore::new(config.storage.paused_dir.clone()),
        );
        let registry = Arc::new(Registry::new());
        let scheduler = Scheduler::new(config.clone(), registry.clone(), Arc::new(fetcher), Arc::new(sink));

        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let sampler = {
            let registry = registry.clone();
            let peak = peak.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    peak.fetch_max(registry.active_tasks(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let (tx, rx) = mpsc::channel(8);
        for id in 1..=5 {
            tx.send(request(id, &format!("http://site{}.test/", id))).await.unwrap();
        }
        drop(tx);

        scheduler.run(rx, CancellationToken::new()).await;
        scheduler.wait().await;
        done.store(true, Ordering::SeqCst);
        sampler.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= config.crawler.tasks);
        assert_eq!(registry.active_tasks(), 0);
        for id in 1..=5 {
            assert!(config.storage.output_dir.join(format!("{}.result.json", id)).exists());
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stall() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.crawler.tasks = 1;
        let config = Arc::new(config);

        let fetcher = Arc::new(
            FakeFetcher::new()
                .with_delay(Duration::from_millis(300))
                .dir("http://slow.test/", &["a.txt"], &["http://slow.test/more/"])
                .dir("http://slow.test/more/", &["b.txt"], &[]),
        );

        let mut sink = MockResultSink::new();
        sink.expect_push_result().never();
        sink.expect_save_task().times(1).returning(|_| Ok(()));

        let registry = Arc::new(Registry::new());
        let scheduler = Scheduler::new(config, registry.clone(), fetcher, Arc::new(sink));
        let (tx, rx) = mpsc::channel(4);
        tx.send(request(1, "http://slow.test/")).await.unwrap();
        tx.send(request(2, "http://slow.test/")).await.unwrap();

        let shutdown = CancellationToken::new();
        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.cancel();
            })
        };

        tokio::time::timeout(Duration::from_millis(200), scheduler.run(rx, shutdown))
            .await
            .expect("scheduler kept waiting after shutdown");
        canceller.await.unwrap();

        // Only the first request was admitted, the second is still queued
        assert!(registry.is_registered(1));
        assert!(!registry.is_registered(2));

        assert_eq!(registry.abort_all(), 1);
        scheduler.wait().await;
        assert_eq!(scheduler.stats().snapshot().tasks_paused, 1);
        drop(tx);
    }
}
