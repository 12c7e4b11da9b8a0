use airsync_cli::{Cli, run};
use airsync_core::logging::{LoggingDestination, init_logging};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let destination = if cli.global.no_log_file {
        LoggingDestination::StderrOnly
    } else {
        LoggingDestination::FileAndStderr
    };
    match init_logging(destination) {
        Ok(Some(path)) => tracing::debug!(log = %path.display(), "logging to file"),
        Ok(None) => {}
        Err(err) => eprintln!("Warning: logging unavailable: {err}"),
    }

    if let Err(err) = run(cli).await {
        tracing::error!(error = %format!("{err:#}"), "airsync failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
