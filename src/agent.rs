//! The agent: a worker process that registers with a collector, waits for
//! a start signal, runs one engine execution against the session target,
//! and optionally loops for subsequent sessions.
//!
//! State transitions are monotonic per session:
//!
//! ```text
//!         register OK
//! idle ─────────────────► registered ──/start──► running ──► finished
//!                              │                    │
//!                              │ /cancel            │ /stop
//!                              ▼                    ▼
//!                          canceled              stopped
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{build_control_client, ClientError, RequestParams};
use crate::config::{AgentConfig, ConfigError};
use crate::engine::{EngineError, LoadEngine};
use crate::session::AgentInfo;
use crate::stats::StatsIdentity;
use crate::utils::random_id;

/// Cadence of collector-liveness pings while registered.
const COLLECTOR_PING_INTERVAL: Duration = Duration::from_secs(5);
/// Per-ping timeout.
const COLLECTOR_PING_TIMEOUT: Duration = Duration::from_secs(3);
/// Consecutive ping failures that abort the session.
const COLLECTOR_PING_FAILURE_LIMIT: u32 = 2;
/// Backoff between registration attempts.
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Agent lifecycle state. finished/stopped/canceled are terminal for the
/// current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Registered,
    Running,
    Finished,
    Stopped,
    Canceled,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Registered => "registered",
            AgentState::Running => "running",
            AgentState::Finished => "finished",
            AgentState::Stopped => "stopped",
            AgentState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Finished | AgentState::Stopped | AgentState::Canceled
        )
    }
}

/// Control signals delivered through the agent's HTTP listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Ready,
    Start,
    Stop,
    Cancel,
    Ping,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Ready => "ready",
            ControlSignal::Start => "start",
            ControlSignal::Stop => "stop",
            ControlSignal::Cancel => "cancel",
            ControlSignal::Ping => "ping",
        }
    }
}

/// The session an agent is currently matched to.
struct ActiveSession {
    test_id: String,
    /// Cancelling this aborts the run and wakes the waiting run loop.
    cancel: CancellationToken,
    /// Bounded(1); a duplicate start delivery is dropped with a log entry.
    start_tx: mpsc::Sender<()>,
}

/// Shared agent state handle, cheap to clone and safe to share between the
/// run loop and the control listener. State transitions take the single
/// inner mutex, so they are totally ordered per agent.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<AgentShared>,
}

struct AgentShared {
    agent_id: String,
    state: Mutex<AgentState>,
    session: Mutex<Option<ActiveSession>>,
}

impl AgentHandle {
    pub fn new(agent_id: String) -> Self {
        Self {
            inner: Arc::new(AgentShared {
                agent_id,
                state: Mutex::new(AgentState::Idle),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.lock().unwrap()
    }

    pub fn set_state(&self, new_state: AgentState) {
        let mut guard = self.inner.state.lock().unwrap();
        if *guard != new_state {
            debug!(
                agent_id = %self.inner.agent_id,
                from = guard.as_str(),
                to = new_state.as_str(),
                "Agent state changed"
            );
            *guard = new_state;
        }
    }

    pub fn current_test_id(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.test_id.clone())
    }

    /// Binds the handle to a session: the run loop installs the session's
    /// cancel token and the bounded(1) start channel after registration.
    pub fn install_session(
        &self,
        test_id: String,
        cancel: CancellationToken,
        start_tx: mpsc::Sender<()>,
    ) {
        *self.inner.session.lock().unwrap() = Some(ActiveSession {
            test_id,
            cancel,
            start_tx,
        });
    }

    pub fn clear_session(&self) {
        *self.inner.session.lock().unwrap() = None;
    }

    fn cancel_session(&self) {
        if let Some(session) = self.inner.session.lock().unwrap().as_ref() {
            session.cancel.cancel();
        }
    }

    /// Applies a control signal. On a state precondition failure the
    /// current state is returned so the listener can answer 409.
    pub fn apply_signal(&self, signal: ControlSignal) -> Result<(), AgentState> {
        let mut state = self.inner.state.lock().unwrap();

        match signal {
            ControlSignal::Ready | ControlSignal::Ping => {
                if *state == AgentState::Registered {
                    Ok(())
                } else {
                    Err(*state)
                }
            }
            ControlSignal::Start => {
                if *state != AgentState::Registered {
                    return Err(*state);
                }
                *state = AgentState::Running;
                drop(state);

                if let Some(session) = self.inner.session.lock().unwrap().as_ref() {
                    // The run loop consumes exactly one signal; a second
                    // delivery finds the channel full.
                    if session.start_tx.try_send(()).is_err() {
                        warn!(
                            agent_id = %self.inner.agent_id,
                            "Duplicate start signal dropped"
                        );
                    }
                }
                Ok(())
            }
            ControlSignal::Stop => {
                match *state {
                    AgentState::Running | AgentState::Registered | AgentState::Idle => {
                        *state = AgentState::Stopped;
                        drop(state);
                        self.cancel_session();
                        Ok(())
                    }
                    _ => Err(*state),
                }
            }
            ControlSignal::Cancel => {
                match *state {
                    AgentState::Registered | AgentState::Idle => {
                        *state = AgentState::Canceled;
                        drop(state);
                        self.cancel_session();
                        Ok(())
                    }
                    _ => Err(*state),
                }
            }
        }
    }
}

/// Wire shape of a successful registration.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "testID")]
    pub test_id: String,
}

/// The agent process core. Owns its configuration and shared handle; the
/// control listener is started separately with a clone of the handle.
pub struct Agent {
    config: AgentConfig,
    handle: AgentHandle,
    control_client: reqwest::Client,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let agent_id = config
            .agent_id
            .clone()
            .unwrap_or_else(|| random_id("aid_"));
        let control_client = build_control_client(Duration::from_secs(5))?;

        Ok(Self {
            config,
            handle: AgentHandle::new(agent_id),
            control_client,
        })
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs the agent until `root` is cancelled (or, without session
    /// looping, until the first session ends).
    pub async fn run(&self, root: CancellationToken) -> Result<(), AgentError> {
        if !self.config.cluster_enabled {
            return self.run_standalone(root).await;
        }

        loop {
            if root.is_cancelled() {
                break;
            }

            let session_cancel = root.child_token();
            let test_id = match self.register_until_matched(&session_cancel).await {
                Some(test_id) => test_id,
                None => break,
            };

            let (start_tx, mut start_rx) = mpsc::channel::<()>(1);
            self.handle
                .install_session(test_id.clone(), session_cancel.clone(), start_tx);
            self.handle.set_state(AgentState::Registered);
            info!(
                agent_id = %self.handle.agent_id(),
                test_id = %test_id,
                "Registered with collector, waiting for start"
            );

            let ping_task = tokio::spawn(ping_collector_loop(
                self.control_client.clone(),
                self.config.collector_host.clone(),
                test_id.clone(),
                self.handle.clone(),
                session_cancel.clone(),
            ));

            tokio::select! {
                started = start_rx.recv() => {
                    if started.is_some() {
                        self.execute_session(&test_id, &session_cancel).await;
                    }
                }
                _ = session_cancel.cancelled() => {
                    debug!(
                        agent_id = %self.handle.agent_id(),
                        test_id = %test_id,
                        state = self.handle.state().as_str(),
                        "Session ended before start"
                    );
                }
            }

            ping_task.abort();
            self.handle.clear_session();

            if !self.config.loop_test_session || root.is_cancelled() {
                break;
            }
            self.handle.set_state(AgentState::Idle);
        }

        Ok(())
    }

    /// One engine execution for the current session. The terminal agent
    /// state mirrors the engine's final snapshot status.
    async fn execute_session(&self, test_id: &str, session_cancel: &CancellationToken) {
        let engine = match self.build_engine(test_id) {
            Ok(engine) => engine,
            Err(e) => {
                error!(error = %e, "Failed to build engine for session");
                self.handle.set_state(AgentState::Stopped);
                return;
            }
        };

        match engine.run(session_cancel.clone()).await {
            Ok(snapshot) if snapshot.status == "finished" => {
                self.handle.set_state(AgentState::Finished);
            }
            Ok(_) => {
                self.handle.set_state(AgentState::Stopped);
            }
            Err(e) => {
                error!(error = %e, "Engine run failed");
                self.handle.set_state(AgentState::Stopped);
            }
        }
    }

    /// One-shot execution against the configured target, no collector.
    async fn run_standalone(&self, root: CancellationToken) -> Result<(), AgentError> {
        self.handle.set_state(AgentState::Running);
        let engine = self.build_engine("")?;
        let snapshot = engine.run(root).await?;
        self.handle.set_state(if snapshot.status == "finished" {
            AgentState::Finished
        } else {
            AgentState::Stopped
        });
        Ok(())
    }

    fn build_engine(&self, test_id: &str) -> Result<LoadEngine, AgentError> {
        let params = RequestParams::new(
            &self.config.test_url,
            &self.config.method,
            &self.config.headers,
            self.config.body.clone().into_bytes(),
            self.config.protocol,
        )?;

        // In cluster mode live and final snapshots feed the collector's
        // report endpoint; the configured sink applies standalone.
        let (push_url, job_name) = if self.config.cluster_enabled {
            (
                format!(
                    "{}/tests/{}/report",
                    self.config.collector_host.trim_end_matches('/'),
                    test_id
                ),
                String::new(),
            )
        } else {
            (
                self.config.push_url.clone(),
                self.config.prometheus_job_name.clone(),
            )
        };

        Ok(LoadEngine {
            workers: self.config.resolved_worker(),
            total: self.config.resolved_total()?,
            duration: self.config.resolved_duration()?,
            push_url,
            prometheus_job_name: job_name,
            push_interval: self.config.resolved_push_interval()?,
            identity: StatsIdentity {
                test_id: test_id.to_string(),
                agent_id: self.handle.agent_id().to_string(),
                url: self.config.test_url.clone(),
                method: params.method.to_string(),
            },
            output_path: None,
            params,
        })
    }

    /// Registers with the collector, retrying every 5 s until matched to
    /// a session or cancelled. Repeated identical failures are logged
    /// once.
    async fn register_until_matched(&self, cancel: &CancellationToken) -> Option<String> {
        let mut last_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            match self.try_register().await {
                Ok(test_id) => return Some(test_id),
                Err(message) => {
                    if last_error.as_deref() != Some(message.as_str()) {
                        warn!(
                            agent_id = %self.handle.agent_id(),
                            error = %message,
                            "Registration failed, retrying"
                        );
                        last_error = Some(message);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(REGISTER_RETRY_DELAY) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn try_register(&self) -> Result<String, String> {
        let info = AgentInfo {
            id: self.handle.agent_id().to_string(),
            callback: self.config.agent_host.clone(),
            url: self.config.test_url.clone(),
            method: self.config.method.to_uppercase(),
            status: String::new(),
        };

        let endpoint = format!(
            "{}/register",
            self.config.collector_host.trim_end_matches('/')
        );
        let response = self
            .control_client
            .post(&endpoint)
            .json(&info)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("collector returned {}: {}", status.as_u16(), body.trim()));
        }

        let payload: RegisterResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(payload.test_id)
    }
}

/// Pings the collector every 5 s while the agent stays `registered`.
/// Two consecutive failures abort the session; the loop exits when the
/// agent enters running or any terminal state.
async fn ping_collector_loop(
    client: reqwest::Client,
    collector_host: String,
    test_id: String,
    handle: AgentHandle,
    session_cancel: CancellationToken,
) {
    let endpoint = format!(
        "{}/ping/{}?agent_id={}",
        collector_host.trim_end_matches('/'),
        test_id,
        handle.agent_id()
    );
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(COLLECTOR_PING_INTERVAL) => {}
            _ = session_cancel.cancelled() => break,
        }

        if handle.state() != AgentState::Registered {
            break;
        }

        let ok = client
            .post(&endpoint)
            .timeout(COLLECTOR_PING_TIMEOUT)
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false);

        if ok {
            consecutive_failures = 0;
            continue;
        }

        consecutive_failures += 1;
        debug!(
            test_id = %test_id,
            failures = consecutive_failures,
            "Collector ping missed"
        );
        if consecutive_failures >= COLLECTOR_PING_FAILURE_LIMIT {
            error!(test_id = %test_id, "collector ping failed");
            session_cancel.cancel();
            break;
        }
    }
}
