use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Identifier of a crawled site
pub type WebsiteId = u64;

/// A crawl task as requested by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Site this task crawls
    pub website_id: WebsiteId,

    /// Root URL of the open directory
    pub url: String,
}

/// A ready-to-run task delivered to the scheduler
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub task: Task,
    pub base_url: Url,
}

impl CrawlRequest {
    /// Parse the task URL into a request
    pub fn new(task: Task) -> Result<Self, url::ParseError> {
        let base_url = Url::parse(&task.url)?;
        Ok(Self { task, base_url })
    }

    pub fn website_id(&self) -> WebsiteId {
        self.task.website_id
    }
}

/// One unit of crawl work: a directory URL to list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Directory to probe
    pub url: Url,

    /// Serialized form of `url`
    pub url_str: String,

    /// Number of failed attempts so far
    pub fails: u32,
}

impl Job {
    /// Create a fresh job for the given URL
    pub fn new(url: Url) -> Self {
        let url_str = url.to_string();
        Self { url, url_str, fails: 0 }
    }

    /// The same job after one more failed attempt
    pub fn retried(&self) -> Self {
        Self {
            url: self.url.clone(),
            url_str: self.url_str.clone(),
            fails: self.fails + 1,
        }
    }
}

/// A discovered leaf entry
///
/// `path` and `name` are percent-encoded as found in the listing until the
/// collector decodes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,

    /// Size in bytes, `-1` if unknown
    pub size: i64,

    /// Modification time in Unix seconds, `0` if unknown
    pub mtime: i64,

    /// Directory containing the file, relative to the host root
    pub path: String,
}

/// Terminal status of a finished crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "directory listing failed")]
    DirectoryListingFailed,
}

impl StatusCode {
    /// Classify a finished crawl from its counters
    pub fn classify(file_count: u64, error_count: u64) -> Self {
        if file_count > 0 {
            StatusCode::Success
        } else if error_count == 0 {
            StatusCode::Empty
        } else {
            StatusCode::DirectoryListingFailed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::Empty => "empty",
            StatusCode::DirectoryListingFailed => "directory listing failed",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate outcome of a crawl task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub website_id: WebsiteId,

    /// Set once the task reached a terminal state through natural completion
    pub status_code: Option<StatusCode>,

    pub file_count: u64,

    pub error_count: u64,

    /// Wall-clock start of the crawl
    #[serde(rename = "start_time_utc")]
    pub start_time: DateTime<Utc>,

    #[serde(rename = "start_time")]
    pub start_time_unix: i64,

    /// Wall-clock end of the crawl (or of the run that paused it)
    #[serde(rename = "end_time_utc")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(rename = "end_time")]
    pub end_time_unix: i64,
}

impl TaskResult {
    /// A fresh result starting now
    pub fn started(website_id: WebsiteId) -> Self {
        let now = Utc::now();
        Self {
            website_id,
            status_code: None,
            file_count: 0,
            error_count: 0,
            start_time: now,
            start_time_unix: now.timestamp(),
            end_time: None,
            end_time_unix: 0,
        }
    }

    /// Copy the counters and stamp the end time
    pub fn stamp_end(&mut self, counters: &TaskCounters) {
        let now = Utc::now();
        self.file_count = counters.file_count();
        self.error_count = counters.error_count();
        self.end_time = Some(now);
        self.end_time_unix = now.timestamp();
    }

    /// Stamp the end time and set the terminal status
    pub fn finalize(&mut self, counters: &TaskCounters) {
        self.stamp_end(counters);
        self.status_code = Some(StatusCode::classify(self.file_count, self.error_count));
    }

    /// Time elapsed between start and end (or now, if still running)
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }
}

/// Per-task counters shared by the workers and the lifecycle manager
#[derive(Debug, Default)]
pub struct TaskCounters {
    /// Jobs pending in the queue or in flight
    in_progress: AtomicI64,
    file_count: AtomicU64,
    error_count: AtomicU64,
}

impl TaskCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_queued(&self) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn job_done(&self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_progress(&self) -> i64 {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn add_file(&self) {
        self.file_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_count(&self) -> u64 {
        self.file_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

/// Externally settable pause request for one task
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live state of one crawl task
#[derive(Debug)]
pub struct TaskRuntime {
    pub task: Task,
    pub base_url: Url,
    pub result: TaskResult,
    pub counters: Arc<TaskCounters>,
    pub abort: AbortFlag,
}

impl TaskRuntime {
    pub fn new(request: CrawlRequest, abort: AbortFlag) -> Self {
        let result = TaskResult::started(request.task.website_id);
        Self {
            task: request.task,
            base_url: request.base_url,
            result,
            counters: Arc::new(TaskCounters::new()),
            abort,
        }
    }

    pub fn website_id(&self) -> WebsiteId {
        self.task.website_id
    }
}

/// State saved for a paused task so a later run can resume it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedTask {
    pub website_id: WebsiteId,
    pub base_url: Url,
    pub result: TaskResult,

    /// Queue directory holding the unprocessed jobs
    pub queue_path: std::path::PathBuf,

    /// Record file holding the files found so far
    pub record_path: std::path::PathBuf,

    pub paused_at: DateTime<Utc>,
}
