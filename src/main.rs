//! Visitor counter - privacy-preserving page view analytics for a small site
//!
//! Serves a static site and counts its page views:
//! - Visitors identified by a hash of address and user agent, never stored raw
//! - Total, unique and per-day counts kept in memory
//! - Debounced write-back to a JSON file or a shared document store

mod config;
mod counter;
mod storage;
mod visitors;
mod web;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::counter::VisitorCounter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = config::Config::load()?;

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Uncaught panics are fatal
    std::panic::set_hook(Box::new(|panic| {
        error!("Fatal: {}", panic);
        std::process::exit(1);
    }));

    info!("Starting visitor counter...");

    let resolver = config.counter.day_key_resolver()?;

    // Open storage and load the last snapshot
    let backend = storage::open_backend(&config.storage).await;
    let counter = VisitorCounter::start(backend, resolver, config.counter.write_back()).await;

    // Serve until SIGINT/SIGTERM
    web::start_server(&config.server, counter.clone(), shutdown_signal()).await?;

    info!("Flushing visitor data before exit");
    if let Err(e) = counter.flush().await {
        error!("Final save failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
