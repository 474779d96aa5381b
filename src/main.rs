//! framecheck: a pipelined TCP transfer harness
//!
//! Streams chunks across a single connection using a length-prefixed,
//! sequenced framing protocol and verifies that every byte sent comes back:
//! - Synthetic random chunks or chunks read from a file
//! - Echo verification by content or by running totals
//! - Optional persistence of the received stream to a file
//! - A bundled echo relay (`--listen`) for local runs
//! - Configuration via CLI arguments or TOML file

mod chunk;
mod chunker;
mod config;
mod connection;
mod error;
mod pipeline;
mod protocol;
mod receiver;
mod sender;
mod server;
mod sink;
mod verifier;

use config::Config;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.listen.clone() {
        Some(listen) => serve(&config, &listen).await,
        None => transfer(&config).await,
    }
}

/// Run the echo relay until the process is stopped.
async fn serve(config: &Config, listen: &str) -> ExitCode {
    info!(
        listen,
        max_connections = config.max_connections,
        "Starting echo relay"
    );

    let result = match server::Server::bind(listen, config.max_connections).await {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Echo relay failed");
            ExitCode::FAILURE
        }
    }
}

/// Run one transfer and map its outcome to the exit status.
async fn transfer(config: &Config) -> ExitCode {
    info!(
        addr = %config.addr,
        buf_size = config.buf_size,
        buf_size_var = config.buf_size_var,
        channel_size = config.channel_size,
        verify = ?config.verify,
        input = ?config.input,
        output = ?config.output,
        duration = ?config.duration,
        total_size = ?config.total_size,
        "Starting transfer"
    );

    match pipeline::run(config).await {
        Ok(report) => {
            info!(total = report.totals.sent, "Total sent");
            if let Some(latency) = report.latency.filter(|l| l.count > 0) {
                info!(
                    frames = latency.count,
                    min = ?latency.min,
                    mean = ?latency.mean(),
                    max = ?latency.max,
                    "Round-trip latency"
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
