use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crawler::task::Job;

/// Journal of queue operations inside the queue directory
const JOURNAL_FILE: &str = "jobs.jsonl";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupted job record in {path} line {line}: {source}")]
    Corrupted {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("queue at {0} is closed")]
    Closed(PathBuf),
}

/// One journal line
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Entry {
    Push { job: Job },
    Pop,
}

/// Pending fetch jobs of one task
///
/// Every push and pop is appended to a journal before it takes effect in
/// memory, so `open` on the same directory recovers the pending jobs even
/// when the queue was never closed. A job popped but not finished before a
/// crash is not recovered.
pub struct JobQueue {
    /// Queue directory
    path: PathBuf,

    /// Pending jobs, oldest first
    jobs: Mutex<VecDeque<Job>>,

    /// Open journal, `None` once closed
    journal: AsyncMutex<Option<File>>,

    /// Wakes workers blocked in `pop`
    notify: Notify,

    closed: AtomicBool,
}

impl JobQueue {
    /// Open the queue stored at `path`, creating it if needed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| QueueError::Io { path: path.clone(), source })?;

        let journal_path = path.join(JOURNAL_FILE);
        let jobs = replay(&journal_path).await?;

        // Start from a journal holding only the pending jobs
        compact(&path, &jobs).await?;
        let journal = OpenOptions::new()
            .append(true)
            .open(&journal_path)
            .await
            .map_err(|source| QueueError::Io { path: journal_path.clone(), source })?;

        debug!("Opened queue at {} with {} pending jobs", path.display(), jobs.len());

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
            journal: AsyncMutex::new(Some(journal)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push a job to the back of the queue
    pub async fn push(&self, job: Job) -> Result<(), QueueError> {
        let mut journal = self.journal.lock().await;
        let Some(file) = journal.as_mut() else {
            return Err(QueueError::Closed(self.path.clone()));
        };

        let entry = Entry::Push { job: job.clone() };
        append(file, &entry)
            .await
            .map_err(|source| QueueError::Io { path: self.path.join(JOURNAL_FILE), source })?;

        self.jobs().push_back(job);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest job without waiting
    pub async fn try_pop(&self) -> Option<Job> {
        let mut journal = self.journal.lock().await;
        let file = journal.as_mut()?;
        let job = self.jobs().pop_front()?;

        // A lost pop record only means the job runs again after a restart
        if let Err(e) = append(file, &Entry::Pop).await {
            warn!("Failed to journal pop in {}: {}", self.path.display(), e);
        }
        Some(job)
    }

    /// Take the oldest job, waiting for one to be pushed
    ///
    /// Returns `None` once `stop` is cancelled or the queue is closed.
    pub async fn pop(&self, stop: &CancellationToken) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if stop.is_cancelled() || self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(job) = self.try_pop().await {
                return Some(job);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = stop.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// Close the queue, keeping unconsumed jobs on disk
    pub async fn close(&self) -> Result<(), QueueError> {
        let mut journal = self.journal.lock().await;
        let Some(file) = journal.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        drop(file);

        let pending = self.jobs().drain(..).collect::<VecDeque<_>>();
        compact(&self.path, &pending).await?;

        debug!("Closed queue at {} with {} pending jobs", self.path.display(), pending.len());

        Ok(())
    }
}

async fn append(file: &mut File, entry: &Entry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await
}

/// Rebuild the pending jobs from the journal at `path`
async fn replay(path: &Path) -> Result<VecDeque<Job>, QueueError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(source) => return Err(QueueError::Io { path: path.to_path_buf(), source }),
    };

    let lines: Vec<&str> = contents.lines().collect();
    let mut jobs = VecDeque::new();

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(Entry::Push { job }) => jobs.push_back(job),
            Ok(Entry::Pop) => {
                jobs.pop_front();
            }
            // A kill mid-write leaves a torn last line
            Err(_) if index + 1 == lines.len() && !contents.ends_with('\n') => {
                warn!("Dropping torn journal record at {} line {}", path.display(), index + 1);
            }
            Err(source) => {
                return Err(QueueError::Corrupted {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })
            }
        }
    }

    Ok(jobs)
}

/// Atomically replace the journal with one push record per pending job
async fn compact(dir: &Path, jobs: &VecDeque<Job>) -> Result<(), QueueError> {
    let journal = dir.join(JOURNAL_FILE);
    let staging = dir.join(format!("{}.tmp", JOURNAL_FILE));
    let io_err = |source: std::io::Error| QueueError::Io { path: journal.clone(), source };

    let mut contents = Vec::new();
    for job in jobs {
        let line = serde_json::to_vec(&Entry::Push { job: job.clone() })
            .map_err(|e| io_err(e.into()))?;
        contents.extend_from_slice(&line);
        contents.push(b'\n');
    }

    let mut file = File::create(&staging).await.map_err(io_err)?;
    file.write_all(&contents).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);
    tokio::fs::rename(&staging, &journal).await.map_err(io_err)?;

    Ok(())
}

/// Remove the queue directory at `path`, if any
pub async fn discard(path: impl AsRef<Path>) -> Result<(), QueueError> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(QueueError::Io { path: path.to_path_buf(), source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    fn job(path: &str) -> Job {
        Job::new(Url::parse(&format!("http://example.com/{}", path)).unwrap())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path().join("1")).await.unwrap();

        queue.push(job("a/")).await.unwrap();
        queue.push(job("b/")).await.unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().await.unwrap(), job("a/"));
        assert_eq!(queue.try_pop().await.unwrap(), job("b/"));
        assert!(queue.try_pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_keeps_pending_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7");

        let queue = JobQueue::open(&path).await.unwrap();
        queue.push(job("a/")).await.unwrap();
        queue.push(job("b/").retried()).await.unwrap();
        queue.push(job("c/")).await.unwrap();
        assert_eq!(queue.try_pop().await.unwrap(), job("a/"));
        queue.close().await.unwrap();
        queue.close().await.unwrap();
        assert!(matches!(queue.push(job("d/")).await, Err(QueueError::Closed(_))));

        let reopened = JobQueue::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.try_pop().await.unwrap().fails, 1);
        assert_eq!(reopened.try_pop().await.unwrap(), job("c/"));
    }

    #[tokio::test]
    async fn test_unclosed_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("11");

        let queue = JobQueue::open(&path).await.unwrap();
        for i in 0..5 {
            queue.push(job(&format!("{}/", i))).await.unwrap();
        }
        assert_eq!(queue.try_pop().await.unwrap(), job("0/"));
        // Killed without close
        drop(queue);

        let recovered = JobQueue::open(&path).await.unwrap();
        assert_eq!(recovered.len(), 4);
        assert_eq!(recovered.try_pop().await.unwrap(), job("1/"));

        // Recovery compacts the journal, a second restart sees the same backlog
        drop(recovered);
        let again = JobQueue::open(&path).await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again.try_pop().await.unwrap(), job("2/"));
    }

    #[tokio::test]
    async fn test_torn_last_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("12");

        let queue = JobQueue::open(&path).await.unwrap();
        queue.push(job("a/")).await.unwrap();
        drop(queue);

        let mut journal = std::fs::OpenOptions::new()
            .append(true)
            .open(path.join(JOURNAL_FILE))
            .unwrap();
        std::io::Write::write_all(&mut journal, b"{\"op\":\"push\",\"job\":{\"url").unwrap();

        let recovered = JobQueue::open(&path).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered.try_pop().await.unwrap(), job("a/"));
    }

    #[tokio::test]
    async fn test_discard_wipes_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");

        let queue = JobQueue::open(&path).await.unwrap();
        queue.push(job("a/")).await.unwrap();
        queue.close().await.unwrap();

        discard(&path).await.unwrap();
        discard(&path).await.unwrap();

        let fresh = JobQueue::open(&path).await.unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::open(dir.path().join("1")).await.unwrap());
        let stop = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let stop = stop.clone();
            tokio::spawn(async move { queue.pop(&stop).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(job("late/")).await.unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(job("late/")));
    }

    #[tokio::test]
    async fn test_pop_returns_none_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::open(dir.path().join("1")).await.unwrap());
        let stop = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let stop = stop.clone();
            tokio::spawn(async move { queue.pop(&stop).await })
        };

        stop.cancel();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupted_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("5");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(JOURNAL_FILE), "not json\n").unwrap();

        match JobQueue::open(&path).await {
            Err(QueueError::Corrupted { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected result: {:?}", other.map(|q| q.len())),
        }
    }
}
