use anyhow::Result;
use tracing::{info, error};

mod cli;
mod crawler;
mod fetch;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    utils::init_logging(args.verbose, args.log_file.as_deref())?;

    info!("Starting od-crawler v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
