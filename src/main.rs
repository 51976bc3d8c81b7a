//! Switchboard - per-user message router between a chat channel and reasoning agents.

use clap::Parser;
use std::process::ExitCode;

use switchboard::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // The guard flushes the file appender when dropped.
    let _guard = match logging::init() {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Parse command line arguments
    let args = Commands::parse();

    // Run the command
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
