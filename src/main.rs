//! lottery-server: bet collection and draw server for lottery agencies
//!
//! Agencies connect over TCP and:
//! - Submit bets in batches, each batch acknowledged once
//! - Ask for the draw, which waits until every agency has asked
//! - Receive the documents of their own winning bets
//!
//! Features:
//! - One task per connection on a multi-threaded runtime
//! - Bets persisted to an append-only CSV file
//! - Graceful shutdown on SIGTERM / Ctrl-C
//! - Configuration via CLI arguments, environment or TOML file

mod barrier;
mod config;
mod connection;
mod handler;
mod ledger;
mod protocol;
mod server;
mod shutdown;
mod storage;
mod transport;

use config::Config;
use server::Server;
use storage::{has_won, CsvBetStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        host = %config.host,
        port = config.port,
        listen_backlog = config.listen_backlog,
        agencies = config.agencies,
        barrier_timeout_secs = config.barrier_timeout.as_secs(),
        bets_path = %config.bets_path.display(),
        "Starting lottery server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let store = CsvBetStore::new(&config.bets_path);
    let server = Server::new(config, Box::new(store), has_won);
    runtime.block_on(server.run(shutdown_signal()))?;

    Ok(())
}

/// Resolve on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "Received signal"),
        _ = terminate => info!(signal = "SIGTERM", "Received signal"),
    }
}
