//! Agent supervision and configuration hot-reload.
//!
//! The supervisor owns the active agent instance. A file watcher detects
//! configuration changes; the new file is loaded and validated, compared
//! deeply to the running configuration, and only when different the
//! current agent is cancelled and a fresh one started. An invalid file
//! never interrupts the running agent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentError};
use crate::config::{AgentConfig, ConfigError};
use crate::control::{start_control_listener, ControlError};

/// Wait after the last file change before reloading.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}

/// What a configuration change event means for the running agent.
#[derive(Debug)]
pub enum ReloadDecision {
    /// The file deep-compares equal to the running configuration.
    Unchanged,
    /// A different valid configuration; restart with it.
    Changed(Box<AgentConfig>),
    /// The file no longer loads or validates; keep the current agent.
    Invalid(String),
}

/// Loads the file and compares it to the running configuration.
pub fn reload_decision(current: &AgentConfig, path: &Path) -> ReloadDecision {
    match AgentConfig::from_file(path) {
        Ok(config) if &config == current => ReloadDecision::Unchanged,
        Ok(config) => ReloadDecision::Changed(Box::new(config)),
        Err(e) => ReloadDecision::Invalid(e.to_string()),
    }
}

fn is_content_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// Starts the debounced file watcher. The returned watcher must stay
/// alive for events to keep flowing.
fn spawn_watcher(
    path: &Path,
    events: mpsc::Sender<()>,
) -> Result<notify::RecommendedWatcher, SupervisorError> {
    let last_change: Arc<Mutex<Option<SystemTime>>> = Arc::new(Mutex::new(None));

    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !is_content_change(&event) {
                    return;
                }
                let now = SystemTime::now();
                {
                    let mut last = last_change.lock().unwrap();
                    if let Some(last_time) = *last {
                        if let Ok(elapsed) = now.duration_since(last_time) {
                            if elapsed < RELOAD_DEBOUNCE {
                                return;
                            }
                        }
                    }
                    *last = Some(now);
                }
                // A full queue already has a pending reload.
                let _ = events.try_send(());
            }
            Err(e) => {
                error!(error = %e, "Config watch error");
            }
        })?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Runs the agent under supervision until `root` is cancelled or the
/// agent finishes on its own (standalone mode, or session looping off).
pub async fn run_supervised(
    config_path: PathBuf,
    root: CancellationToken,
) -> Result<(), SupervisorError> {
    let mut config = AgentConfig::from_file(&config_path)?;

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let _watcher = spawn_watcher(&config_path, reload_tx)?;
    info!(path = %config_path.display(), "Watching configuration for changes");

    loop {
        let instance_cancel = root.child_token();
        let agent = Arc::new(Agent::new(config.clone())?);

        let _control = if agent.config().cluster_enabled {
            Some(start_control_listener(
                agent.handle(),
                &agent.config().agent_host,
                instance_cancel.clone(),
            )?)
        } else {
            None
        };

        let mut runner = {
            let agent = agent.clone();
            let cancel = instance_cancel.clone();
            tokio::spawn(async move { agent.run(cancel).await })
        };

        enum Next {
            Shutdown,
            Restart(Box<AgentConfig>),
            Finished(Result<(), AgentError>),
        }

        let next = loop {
            tokio::select! {
                _ = root.cancelled() => break Next::Shutdown,
                joined = &mut runner => {
                    break Next::Finished(joined.unwrap_or_else(|e| {
                        error!(error = %e, "Agent task aborted");
                        Ok(())
                    }));
                }
                _ = reload_rx.recv() => {
                    match reload_decision(&config, &config_path) {
                        ReloadDecision::Unchanged => {
                            info!("Configuration unchanged, restart skipped");
                        }
                        ReloadDecision::Changed(new_config) => {
                            info!("Configuration changed, restarting agent");
                            break Next::Restart(new_config);
                        }
                        ReloadDecision::Invalid(message) => {
                            warn!(error = %message, "Ignoring invalid configuration change");
                        }
                    }
                }
            }
        };

        match next {
            Next::Shutdown => {
                instance_cancel.cancel();
                let _ = runner.await;
                return Ok(());
            }
            Next::Restart(new_config) => {
                instance_cancel.cancel();
                let _ = runner.await;
                config = *new_config;
            }
            Next::Finished(result) => {
                debug!("Agent finished on its own");
                instance_cancel.cancel();
                return result.map_err(SupervisorError::from);
            }
        }
    }
}
