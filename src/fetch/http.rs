use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::CrawlerSettings;
use crate::crawler::task::{File, Job};
use crate::fetch::{FetchError, Fetcher, Listing};

/// Lists open directories over HTTP
pub struct HttpFetcher {
    client: Client,
    parser: ListingParser,
    head_files: bool,
}

impl HttpFetcher {
    /// Create a fetcher with the given crawler settings
    pub fn new(settings: &CrawlerSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            parser: ListingParser::new(&settings.exclude)?,
            head_files: settings.head_files,
        })
    }

    /// Fill size and modification time from a HEAD request
    async fn head_file(&self, url: &Url, file: &mut File) {
        let response = match self.client.head(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                return;
            }
        };

        if !response.status().is_success() {
            debug!("HEAD {} answered with {}", url, response.status());
            return;
        }

        let headers = response.headers();

        if let Some(size) = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
        {
            file.size = size;
        }

        if let Some(mtime) = headers
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        {
            file.mtime = mtime.timestamp();
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, job: &Job) -> Result<Listing, FetchError> {
        let dir = directory_url(&job.url);
        let transport = |source| FetchError::Transport { url: job.url_str.clone(), source };

        debug!("Listing {}", job.url_str);

        let response = self.client.get(dir.clone()).send().await.map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: job.url_str.clone(), status: status.as_u16() });
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map_or(true, |value| value.starts_with("text/html"));
        if !is_html {
            return Err(FetchError::NotListing { url: job.url_str.clone() });
        }

        let body = response.text().await.map_err(transport)?;
        let (entries, dirs) = self.parser.parse_entries(&dir, &body);

        let mut files = Vec::with_capacity(entries.len());
        for (url, mut file) in entries {
            if self.head_files {
                self.head_file(&url, &mut file).await;
            }
            files.push(file);
        }

        Ok(Listing { files, dirs })
    }
}

/// Extracts entries from an HTML directory index
pub struct ListingParser {
    anchors: Selector,
    exclude: Vec<Regex>,
}

impl ListingParser {
    pub fn new(exclude: &[String]) -> Result<Self> {
        let anchors = Selector::parse("a[href]")
            .map_err(|e| anyhow::anyhow!("Invalid anchor selector: {}", e))?;

        let exclude = exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern).context(format!("Invalid exclude pattern '{}'", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { anchors, exclude })
    }

    /// Parse a listing into its files and sub-directories
    #[cfg(test)]
    pub fn parse(&self, dir: &Url, html: &str) -> Listing {
        let (entries, dirs) = self.parse_entries(&directory_url(dir), html);
        Listing {
            files: entries.into_iter().map(|(_, file)| file).collect(),
            dirs,
        }
    }

    fn parse_entries(&self, dir: &Url, html: &str) -> (Vec<(Url, File)>, Vec<Url>) {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        for element in document.select(&self.anchors) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };

            // Sort links and in-page anchors
            if href.is_empty() || href.starts_with('?') || href.starts_with('#') {
                continue;
            }

            let mut link = match dir.join(href) {
                Ok(link) => link,
                Err(e) => {
                    debug!("Skipping unparsable link {:?} in {}: {}", href, dir, e);
                    continue;
                }
            };
            link.set_fragment(None);

            if link.query().is_some() || link.origin() != dir.origin() {
                continue;
            }

            // Only descend, never climb to a parent
            if !link.path().starts_with(dir.path()) || link.path().len() <= dir.path().len() {
                continue;
            }

            if self.exclude.iter().any(|pattern| pattern.is_match(link.as_str())) {
                debug!("Skipping excluded link: {}", link);
                continue;
            }

            if !seen.insert(link.path().to_string()) {
                continue;
            }

            if link.path().ends_with('/') {
                dirs.push(link);
                continue;
            }

            let Some((parent, name)) = link.path().rsplit_once('/') else {
                warn!("Link without path separator: {}", link);
                continue;
            };

            let file = File {
                name: name.to_string(),
                size: -1,
                mtime: 0,
                path: parent.trim_matches('/').to_string(),
            };
            files.push((link, file));
        }

        (files, dirs)
    }
}

/// The URL with a trailing slash on its path
fn directory_url(url: &Url) -> Url {
    if url.path().ends_with('/') {
        return url.clone();
    }
    let mut dir = url.clone();
    let path = format!("{}/", url.path());
    dir.set_path(&path);
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INDEX: &str = r#"<html><head><title>Index of /pub</title></head><body>
        <h1>Index of /pub</h1>
        <a href="?C=N;O=D">Name</a> <a href="?C=M;O=A">Last modified</a>
        <a href="/">Parent Directory</a>
        <a href="../">../</a>
        <a href="isos/">isos/</a>
        <a href="my%20notes.txt">my notes.txt</a>
        <a href="readme.md#top">readme.md</a>
        <a href="readme.md">readme.md</a>
        <a href="http://elsewhere.example/pub/x.zip">mirror</a>
        <a href=".git/">.git/</a>
    </body></html>"#;

    fn settings() -> CrawlerSettings {
        CrawlerSettings {
            exclude: vec![r"/\.git/$".to_string()],
            ..CrawlerSettings::default()
        }
    }

    #[test]
    fn test_parse_listing() {
        let parser = ListingParser::new(&settings().exclude).unwrap();
        let dir = Url::parse("http://example.com/pub").unwrap();

        let listing = parser.parse(&dir, INDEX);

        assert_eq!(listing.dirs, vec![Url::parse("http://example.com/pub/isos/").unwrap()]);
        let names: Vec<_> = listing.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["my%20notes.txt", "readme.md"]);
        assert!(listing.files.iter().all(|f| f.path == "pub" && f.size == -1));
    }

    #[test]
    fn test_directory_url() {
        let url = Url::parse("http://example.com/a/b").unwrap();
        assert_eq!(directory_url(&url).as_str(), "http://example.com/a/b/");
        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(directory_url(&url).as_str(), "http://example.com/");
    }

    #[tokio::test]
    async fn test_fetch_listing_with_head() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/pub/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(INDEX, "text/html"))
            .mount(&server)
            .await;

        Mock::given(method("HEAD"))
            .and(path("/pub/readme.md"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Length", "1234")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&server)
            .await;

        let mut settings = settings();
        settings.head_files = true;
        let fetcher = HttpFetcher::new(&settings).unwrap();

        let job = Job::new(Url::parse(&format!("{}/pub/", server.uri())).unwrap());
        let listing = fetcher.fetch(&job).await.unwrap();

        assert_eq!(listing.dirs.len(), 1);
        let readme = listing.files.iter().find(|f| f.name == "readme.md").unwrap();
        assert_eq!(readme.size, 1234);
        assert_eq!(readme.mtime, 1445412480);

        // No HEAD mock for this one, wiremock answers 404
        let notes = listing.files.iter().find(|f| f.name == "my%20notes.txt").unwrap();
        assert_eq!(notes.size, -1);
    }

    #[tokio::test]
    async fn test_fetch_error_statuses() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/busy/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/file.bin/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("binary", "application/octet-stream"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&settings()).unwrap();

        let busy = Job::new(Url::parse(&format!("{}/busy/", server.uri())).unwrap());
        let err = fetcher.fetch(&busy).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert!(err.is_retryable());

        let missing = Job::new(Url::parse(&format!("{}/missing/", server.uri())).unwrap());
        let err = fetcher.fetch(&missing).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert!(!err.is_retryable());

        let binary = Job::new(Url::parse(&format!("{}/file.bin", server.uri())).unwrap());
        let err = fetcher.fetch(&binary).await.unwrap_err();
        assert!(matches!(err, FetchError::NotListing { .. }));
    }
}
