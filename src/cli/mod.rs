pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use self::config::CrawlerConfig;

#[derive(Parser)]
#[command(author, version, about = "Crawls open directories and collects their file listings", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl one or more open directories
    Crawl {
        /// Root URLs, one task each
        #[arg(required = true)]
        urls: Vec<String>,

        /// Site id of the first URL, the next ones count up
        #[arg(long, default_value_t = 1)]
        id: u64,

        /// Fetch workers per task
        #[arg(short, long)]
        workers: Option<usize>,

        /// Tasks crawled at the same time
        #[arg(short, long)]
        tasks: Option<usize>,
    },

    /// List paused tasks, or show one in full
    Paused {
        /// Site id to show
        id: Option<u64>,
    },

    /// Show the configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { urls, id, workers, tasks } => {
            let mut config = CrawlerConfig::load(cli.config.as_deref())?;

            // Command line overrides the file
            if let Some(workers) = workers {
                config.crawler.workers = workers;
            }
            if let Some(tasks) = tasks {
                config.crawler.tasks = tasks;
            }
            config.validate()?;

            info!("Starting crawl of {} sites", urls.len());
            commands::crawl(config, urls, id).await
        },
        Commands::Paused { id } => {
            let config = CrawlerConfig::load(cli.config.as_deref())?;
            match id {
                Some(id) => commands::show_paused(&config, id).await,
                None => commands::paused(&config).await,
            }
        },
        Commands::Config { init } => {
            if init {
                info!("Writing default configuration");
                commands::init_config(cli.config.as_deref()).await
            } else {
                let config = CrawlerConfig::load(cli.config.as_deref())?;
                commands::show_config(&config).await
            }
        },
    }
}
