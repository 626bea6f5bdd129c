use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::Path;
use std::fs;

/// Filter for the crawler's own events, noisy dependencies stay at warn
fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("od_crawler={}", level).parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let fmt_layer = fmt::layer().with_target(verbose);

    // Mirror everything into a log file when one is given
    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create log directory: {}", parent.display()))?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context(format!("Failed to open log file: {}", log_file.display()))?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter(verbose)?)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(verbose)?)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}
