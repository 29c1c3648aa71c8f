//! echod: a multi-client line-oriented TCP echo server
//!
//! Clients connect, receive a welcome line, and have every subsequent line
//! echoed back with a timestamp until they send "Good Bye!". An operator
//! console on stdin can list active sessions, force-disconnect one by id,
//! or shut the server down.
//!
//! Features:
//! - One task per client session; a slow client never stalls the others
//! - Shared session registry with atomic register/list/disconnect
//! - Configuration via CLI arguments or TOML file

mod config;
mod console;
mod registry;
mod server;
mod session;

use config::Config;
use registry::Registry;
use server::Server;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_line_length = config.max_line_length,
        "Starting echod server"
    );

    let registry = Arc::new(Registry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // The console gets its own sender; this one stays alive so a console
    // exit on stdin EOF does not tear the channel down under the server.
    tokio::spawn(console::run(Arc::clone(&registry), shutdown_tx.clone()));

    let server = Server::new(config, Arc::clone(&registry));
    if let Err(e) = server.run(shutdown_rx).await {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    println!("{} - The server has exited. Bye!", session::timestamp());
    Ok(())
}
