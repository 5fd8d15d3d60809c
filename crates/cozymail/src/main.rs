use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod credentials;
mod epoch;
mod flagged;
mod notify;
mod pipeline;
mod services;
mod supervisor;
mod trainer;
mod watcher;

#[cfg(test)]
mod test_support;

use cli::{Cli, output_error, run_cli};
use config::load_service_config;

/// How long exit waits for blocking IMAP calls; an abandoned IDLE would
/// otherwise hold the process until its timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn init_tracing() {
    let filter = EnvFilter::try_from_env("COZYMAIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_service_config(cli.config.as_deref());
    if let Some(err) = config.load_error.as_deref() {
        tracing::warn!(error = err, "config not loaded, using defaults");
    }

    let rt = Arc::new(tokio::runtime::Runtime::new()?);
    let result = run_cli(&rt, cli.command, config, cli.config.as_deref());
    shutdown_runtime(rt, SHUTDOWN_GRACE);
    if let Err(err) = result {
        return output_error(&format!("{:#}", err));
    }
    Ok(())
}

fn shutdown_runtime(rt: Arc<tokio::runtime::Runtime>, grace: Duration) {
    match Arc::try_unwrap(rt) {
        Ok(rt) => rt.shutdown_timeout(grace),
        Err(_) => tracing::debug!("runtime still shared at exit"),
    }
}
