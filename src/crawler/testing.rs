//! Test doubles shared by the crawler tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::cli::config::CrawlerConfig;
use crate::crawler::task::{File, Job};
use crate::fetch::{FetchError, Fetcher, Listing};

enum Page {
    Listing(Listing),
    Fail(u16),
}

/// In-memory site map answering fetches by URL
///
/// Unknown URLs answer 404.
pub struct FakeFetcher {
    pages: HashMap<String, Page>,
    delay: Duration,
    fetched: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            delay: Duration::ZERO,
            fetched: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Add a directory listing files (encoded names) and sub-directories
    pub fn dir(mut self, url: &str, files: &[&str], dirs: &[&str]) -> Self {
        let parsed = Url::parse(url).unwrap();
        let path = parsed.path().trim_matches('/').to_string();
        let listing = Listing {
            files: files
                .iter()
                .map(|name| File {
                    name: name.to_string(),
                    size: 1,
                    mtime: 0,
                    path: path.clone(),
                })
                .collect(),
            dirs: dirs.iter().map(|dir| Url::parse(dir).unwrap()).collect(),
        };
        self.pages.insert(parsed.to_string(), Page::Listing(listing));
        self
    }

    /// Make a URL answer with an HTTP error
    pub fn failing(mut self, url: &str, status: u16) -> Self {
        let parsed = Url::parse(url).unwrap();
        self.pages.insert(parsed.to_string(), Page::Fail(status));
        self
    }

    /// Number of fetches started so far
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, job: &Job) -> Result<Listing, FetchError> {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.pages.get(&job.url_str) {
            Some(Page::Listing(listing)) => Ok(listing.clone()),
            Some(Page::Fail(status)) => Err(FetchError::Status { url: job.url_str.clone(), status: *status }),
            None => Err(FetchError::Status { url: job.url_str.clone(), status: 404 }),
        }
    }
}

/// Configuration with fast timings and storage under `root`
pub fn test_config(root: &Path) -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.crawler.workers = 2;
    config.crawler.tasks = 2;
    config.crawler.retries = 1;
    config.crawler.retry_delay_ms = 1;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.stall_interval_ms = 10;
    config.stats.interval_secs = 3600;
    config.storage.queue_root = root.join("queue");
    config.storage.crawled_dir = root.join("crawled");
    config.storage.paused_dir = root.join("paused");
    config.storage.output_dir = root.join("results");
    config
}
