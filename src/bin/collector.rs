//! Collector entry point: serves the session-coordination HTTP surface.
//!
//! Usage: `collector [config-path]`; without an argument the default
//! listen address is used.

use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loadswarm::collector::CollectorService;
use loadswarm::config::CollectorConfig;

/// Drain window for in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match CollectorConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path, error = %e, "Failed to load collector configuration");
                std::process::exit(1);
            }
        },
        None => CollectorConfig::default(),
    };

    let addr = match config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen_addr = %config.listen_addr, error = %e, "Invalid listen address");
            std::process::exit(1);
        }
    };

    let service = match CollectorService::new() {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Failed to initialize collector");
            std::process::exit(1);
        }
    };

    let server = match service.start(addr) {
        Ok(server) => server,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind collector");
            std::process::exit(1);
        }
    };

    wait_for_termination().await;
    info!("Termination signal received, draining");
    service.shutdown();

    tokio::select! {
        _ = server.task => {}
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            error!("Shutdown grace window elapsed, exiting");
        }
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
