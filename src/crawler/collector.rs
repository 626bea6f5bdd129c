use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{File as FsFile, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::crawler::task::{File, WebsiteId};
use crate::utils::escape::unescape_lossy;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed writing crawl results to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize discovered file: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Open a record file for appending, creating it if needed
pub async fn open_record_file(path: &Path) -> std::io::Result<FsFile> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Spawn a collector draining `results` into `file`
///
/// The handle resolves to the number of records written once every sender of
/// `results` is gone, or to the first write error.
pub fn spawn(
    website_id: WebsiteId,
    results: mpsc::Receiver<File>,
    file: FsFile,
    path: PathBuf,
) -> JoinHandle<Result<u64, CollectError>> {
    tokio::spawn(async move {
        let outcome = collect(results, file, &path).await;
        match &outcome {
            Ok(written) => debug!(website_id, "Collected {} records into {}", written, path.display()),
            Err(e) => error!(website_id, "Failed saving crawl results: {}", e),
        }
        outcome
    })
}

/// Write every received file as one decoded JSON line
pub async fn collect(
    mut results: mpsc::Receiver<File>,
    mut file: FsFile,
    path: &Path,
) -> Result<u64, CollectError> {
    let io_err = |source| CollectError::Write { path: path.to_path_buf(), source };
    let mut written = 0;

    while let Some(mut entry) = results.recv().await {
        entry.path = unescape_lossy(&entry.path);
        entry.name = unescape_lossy(&entry.name);

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        written += 1;
    }

    file.sync_all().await.map_err(io_err)?;

    Ok(written)
}
