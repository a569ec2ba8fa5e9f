//! Logflow Ingest - command line entry point

use clap::Parser;
use logflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use logflow_ingest::{commands, Cli};
use std::process;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    // Reported once logging is up; a missing .env is normal
    let dotenv_error = dotenvy::dotenv().err().filter(|e| !e.not_found());
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("logflow-ingest")
        .build();

    // Environment variables take precedence over the flags
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config).ok();

    if let Some(e) = dotenv_error {
        warn!(error = %e, "Could not load .env file");
    }

    match commands::execute(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            process::exit(1);
        },
    }
}
