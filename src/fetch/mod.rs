pub mod http;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::crawler::task::{File, Job};

// Re-export common types
pub use http::HttpFetcher;

/// What one directory listing contained
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    /// Files found in the directory
    pub files: Vec<File>,

    /// Sub-directories to crawl next
    pub dirs: Vec<Url>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} is not a directory listing")]
    NotListing { url: String },
}

impl FetchError {
    /// Whether trying the same job again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::NotListing { .. } => false,
        }
    }
}

/// Lists one directory
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, job: &Job) -> Result<Listing, FetchError>;
}
