//! ws-echo-server: a WebSocket echo server for client testing
//!
//! Accepts WebSocket connections and sends every text or binary message
//! straight back to the client that sent it, keeping its type.
//!
//! Features:
//! - One task per connection, echoes strictly in arrival order
//! - Connect/disconnect logging with the active connection count
//! - Per-message debug logging with `--verbose`
//! - Configuration via CLI arguments or TOML file

mod config;
mod echo;
mod logging;
mod registry;
mod server;
mod shutdown;

use config::Config;
use server::Server;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_level, config.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let host = config.host.clone();
    let server = Server::bind(config)
        .await
        .map_err(|e| format!("failed to bind {host}: {e}"))?;
    let addr = server.local_addr()?;
    let addresses = server.local_addrs()?;

    info!(
        host = %host,
        addresses = ?addresses,
        "Starting WebSocket echo server on ws://{}:{}",
        host,
        addr.port()
    );
    info!("Press Ctrl+C to stop");

    server.run(shutdown::shutdown_signal()).await?;
    Ok(())
}
