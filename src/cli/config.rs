use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub server: ServerSettings,
    pub stats: StatsSettings,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    pub workers: usize,  // Fetch workers per task
    pub tasks: usize,    // Maximum number of concurrently running tasks
    pub retries: u32,    // Attempts per job before it counts as an error
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub head_files: bool,  // HEAD every file for size and modification time
    pub exclude: Vec<String>,  // Regex patterns of URLs never entered
    pub results_buffer: usize,
}

/// Admission loop and lifecycle timing
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_ms: u64,
    pub stall_interval_ms: u64,
}

/// On-disk locations
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub queue_root: PathBuf,
    pub crawled_dir: PathBuf,
    pub paused_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Result upload server
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

/// Periodic statistics
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StatsSettings {
    pub interval_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerSettings::default(),
            scheduler: SchedulerSettings::default(),
            storage: StorageSettings::default(),
            server: ServerSettings::default(),
            stats: StatsSettings::default(),
        }
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            tasks: 2,
            retries: 3,
            retry_delay_ms: 500,
            timeout_secs: 30,
            user_agent: format!("od-crawler/{}", env!("CARGO_PKG_VERSION")),
            head_files: false,
            exclude: vec![],
            results_buffer: 256,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            stall_interval_ms: 1000,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            queue_root: PathBuf::from("queue"),
            crawled_dir: PathBuf::from("crawled"),
            paused_dir: PathBuf::from("paused"),
            output_dir: PathBuf::from("results"),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:5000/api".to_string(),
            token: None,
            timeout_secs: 120,
        }
    }
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl CrawlerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_interval(&self) -> Duration {
        Duration::from_millis(self.stall_interval_ms)
    }
}

impl StatsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl StorageSettings {
    /// Queue directory of one site
    pub fn queue_path(&self, website_id: u64) -> PathBuf {
        self.queue_root.join(website_id.to_string())
    }

    /// Record file of one site
    pub fn record_path(&self, website_id: u64) -> PathBuf {
        self.crawled_dir.join(format!("{}.json", website_id))
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "od-crawler", "od-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load the given file, or the default configuration if none is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.crawler.workers == 0 {
            anyhow::bail!("crawler.workers must be at least 1");
        }
        if self.crawler.tasks == 0 {
            anyhow::bail!("crawler.tasks must be at least 1");
        }
        if self.crawler.results_buffer == 0 {
            anyhow::bail!("crawler.results_buffer must be at least 1");
        }
        if self.scheduler.poll_interval_ms == 0 || self.scheduler.stall_interval_ms == 0 {
            anyhow::bail!("scheduler intervals must be at least 1ms");
        }
        for pattern in &self.crawler.exclude {
            regex::Regex::new(pattern)
                .context(format!("Invalid exclude pattern '{}'", pattern))?;
        }
        Ok(())
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        self.save_to_file(&Self::default_path())
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
