//! Agent entry point: runs a supervised load-generating agent from a
//! YAML configuration file.
//!
//! Usage: `agent [config-path]` (default `agent.yaml`).

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loadswarm::supervisor::run_supervised;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("agent.yaml"));

    let root = CancellationToken::new();
    spawn_signal_listener(root.clone());

    match run_supervised(config_path, root).await {
        Ok(()) => {
            info!("Agent shut down");
        }
        Err(e) => {
            error!(error = %e, "Agent failed");
            std::process::exit(1);
        }
    }
}

/// SIGINT/SIGTERM cancel the root token; every task hangs off it.
fn spawn_signal_listener(root: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Termination signal received");
        root.cancel();
    });
}
