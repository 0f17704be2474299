//! The collector: session coordinator for distributed load tests.
//!
//! Manages test sessions, matches incoming agent registrations to pending
//! sessions of compatible target and method, runs readiness checks,
//! broadcasts start/stop signals, ingests per-agent reports and computes
//! the aggregated snapshot.
//!
//! All session mutation happens under one store mutex with no awaits
//! inside the critical section; control-plane HTTP rounds (readiness,
//! liveness, broadcasts) collect their targets under the lock, release
//! it, and fan out through a bounded pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::RegisterResponse;
use crate::client::{build_control_client, ClientError};
use crate::fanout::{pool_size, run_bounded};
use crate::session::{AdmissionError, AgentInfo, SessionState, TestSession};
use crate::stats::StatsSnapshot;
use crate::utils::random_id;

/// Per-signal timeout for control calls to agents.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(3);
/// Overall budget for one readiness round.
const READY_ROUND_BUDGET: Duration = Duration::from_secs(5);
/// Delay between readiness rounds and between liveness rounds.
const COORDINATION_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Failed to bind collector listener: {0}")]
    Bind(#[from] hyper::Error),
}

/// Why a registration was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterRejection {
    /// Duplicate id or target mismatch → 409.
    Conflict(String),
    /// No suitable session → 503.
    Unavailable(String),
}

/// Response of `POST /tests`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub test_id: String,
    /// "registered/expected", e.g. "1/2".
    pub agent_num: String,
}

/// Response of `GET /tests/<id>/report`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionReportView {
    pub status: String,
    pub report: Option<StatsSnapshot>,
    pub registered_agents: usize,
    pub expected_agents: usize,
}

/// Sessions indexed by test id, kept in creation order so matchmaking's
/// "first found" is deterministic.
#[derive(Default)]
struct SessionStore {
    sessions: HashMap<String, TestSession>,
    order: Vec<String>,
}

impl SessionStore {
    fn insert(&mut self, session: TestSession) {
        self.order.push(session.test_id.clone());
        self.sessions.insert(session.test_id.clone(), session);
    }

    fn in_order(&self) -> impl Iterator<Item = &TestSession> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }
}

/// Shared collector service, cheap to clone into HTTP handlers and
/// background coordination tasks.
#[derive(Clone)]
pub struct CollectorService {
    inner: Arc<CollectorShared>,
}

struct CollectorShared {
    store: Mutex<SessionStore>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

/// A bound and serving collector listener.
pub struct CollectorServer {
    pub addr: SocketAddr,
    pub task: JoinHandle<()>,
}

impl CollectorService {
    pub fn new() -> Result<Self, CollectorError> {
        Ok(Self {
            inner: Arc::new(CollectorShared {
                store: Mutex::new(SessionStore::default()),
                client: build_control_client(SIGNAL_TIMEOUT)?,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Stops background coordination loops and the HTTP listener.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    /// Creates a session expecting `agent_num` agents, or returns the
    /// oldest pending session that can still admit agents.
    pub fn create_session(&self, agent_num: usize) -> CreateSessionResponse {
        let mut store = self.inner.store.lock().unwrap();

        if let Some(pending) = store
            .in_order()
            .find(|session| session.state == SessionState::Pending && !session.is_full())
        {
            return CreateSessionResponse {
                test_id: pending.test_id.clone(),
                agent_num: format!("{}/{}", pending.agents.len(), pending.expected_agents),
            };
        }

        let session = TestSession::new(random_id("tid_"), agent_num);
        let response = CreateSessionResponse {
            test_id: session.test_id.clone(),
            agent_num: format!("0/{}", agent_num),
        };
        info!(
            test_id = %session.test_id,
            expected_agents = agent_num,
            "Test session created"
        );
        store.insert(session);
        drop(store);

        self.spawn_liveness_loop(response.test_id.clone());
        response
    }

    /// Matchmaking: prefer the oldest partially-filled pending session of
    /// the same target, else the oldest empty pending session. A
    /// partially-filled session with a different target rejects with a
    /// conflict when no empty session can take the agent.
    pub fn register_agent(&self, info: AgentInfo) -> Result<RegisterResponse, RegisterRejection> {
        let chosen = {
            let mut store = self.inner.store.lock().unwrap();

            let mut mismatch: Option<(String, String)> = None;
            let mut chosen: Option<String> = None;

            for session in store.in_order() {
                if session.state != SessionState::Pending || session.is_full() {
                    continue;
                }
                if session.is_empty() {
                    continue;
                }
                if session.target_matches(&info.url, &info.method) {
                    chosen = Some(session.test_id.clone());
                    break;
                }
                if mismatch.is_none() {
                    let first = session.first_agent().expect("non-empty session");
                    mismatch = Some((first.method.clone(), first.url.clone()));
                }
            }

            if chosen.is_none() {
                chosen = store
                    .in_order()
                    .find(|session| {
                        session.state == SessionState::Pending && session.is_empty()
                    })
                    .map(|session| session.test_id.clone());
            }

            let test_id = match chosen {
                Some(test_id) => test_id,
                None => {
                    return match mismatch {
                        Some((method, url)) => Err(RegisterRejection::Conflict(format!(
                            "target mismatch: the pending session runs [{}] {}",
                            method, url
                        ))),
                        None => Err(RegisterRejection::Unavailable(
                            "no pending test session can accept this agent".to_string(),
                        )),
                    };
                }
            };

            let session = store
                .sessions
                .get_mut(&test_id)
                .expect("chosen session exists");
            let agent_id = info.id.clone();
            match session.admit(info) {
                Ok(()) => (test_id, agent_id, session.is_full()),
                Err(e @ AdmissionError::Full) => {
                    return Err(RegisterRejection::Unavailable(e.to_string()));
                }
                Err(e) => {
                    return Err(RegisterRejection::Conflict(e.to_string()));
                }
            }
        };

        let (test_id, agent_id, full) = chosen;
        if full {
            self.spawn_readiness_coordination(test_id.clone());
        }

        Ok(RegisterResponse { agent_id, test_id })
    }

    /// Ingests one agent report under the session lock and recomputes the
    /// aggregate. Reports for terminal sessions are ignored.
    pub fn ingest_report(&self, test_id: &str, report: StatsSnapshot) -> bool {
        let mut store = self.inner.store.lock().unwrap();
        let session = match store.sessions.get_mut(test_id) {
            Some(session) => session,
            None => return false,
        };

        if session.state.is_terminal() {
            debug!(
                test_id = %test_id,
                agent_id = %report.agent_id,
                "Report for terminal session ignored"
            );
            return true;
        }

        let agent_id = report.agent_id.clone();
        session.ingest_report(&agent_id, report);
        true
    }

    /// The current view of a session, if it exists.
    pub fn report_view(&self, test_id: &str) -> Option<SessionReportView> {
        let store = self.inner.store.lock().unwrap();
        store.sessions.get(test_id).map(|session| SessionReportView {
            status: session.state.as_str().to_string(),
            report: session.aggregated.clone(),
            registered_agents: session.agents.len(),
            expected_agents: session.expected_agents,
        })
    }

    /// Stops a session: the state changes first, then `/stop` goes out to
    /// every agent that has not delivered a final report.
    pub async fn stop_session(&self, test_id: &str) -> bool {
        let targets = {
            let mut store = self.inner.store.lock().unwrap();
            let session = match store.sessions.get_mut(test_id) {
                Some(session) => session,
                None => return false,
            };
            if session.state.is_terminal() {
                Vec::new()
            } else {
                session.transition(SessionState::Stopped);
                session.agents_without_final()
            }
        };

        self.broadcast(test_id, "stop", targets).await;
        true
    }

    /// Answers an agent liveness ping: the agent must belong to a
    /// non-terminal session.
    pub fn agent_ping(&self, test_id: &str, agent_id: &str) -> StatusCode {
        let store = self.inner.store.lock().unwrap();
        match store.sessions.get(test_id) {
            None => StatusCode::NOT_FOUND,
            Some(session) if session.state.is_terminal() => StatusCode::CONFLICT,
            Some(session) if !session.agents.contains_key(agent_id) => StatusCode::NOT_FOUND,
            Some(_) => StatusCode::OK,
        }
    }

    // ── Coordination loops ───────────────────────────────────────────────

    /// Readiness coordination: once a session fills, every admitted agent
    /// must answer `/ready` before `/start` is broadcast. Rounds repeat
    /// every 5 s until all are ready or the session leaves pending.
    fn spawn_readiness_coordination(&self, test_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                if service.inner.shutdown.is_cancelled() {
                    return;
                }

                // The readiness target is the session's expected agent
                // count, not the currently admitted set: liveness may
                // have evicted an agent since the session filled, and a
                // shrunken set must keep waiting for re-registration.
                let (agents, expected_agents) = {
                    let store = service.inner.store.lock().unwrap();
                    match store.sessions.get(&test_id) {
                        Some(session) if session.state == SessionState::Pending => (
                            session.agents.values().cloned().collect::<Vec<_>>(),
                            session.expected_agents,
                        ),
                        // Started or aborted elsewhere; nothing to coordinate.
                        _ => return,
                    }
                };

                let ready = service.ready_round(&test_id, agents).await;

                if expected_agents > 0 && ready == expected_agents {
                    let targets = {
                        let mut store = service.inner.store.lock().unwrap();
                        match store.sessions.get_mut(&test_id) {
                            // An eviction between the round and this lock
                            // re-opens the session; the next fill spawns a
                            // fresh coordination task.
                            Some(session)
                                if session.state == SessionState::Pending
                                    && session.is_full() =>
                            {
                                session.transition(SessionState::Running);
                                session.agents.values().cloned().collect::<Vec<_>>()
                            }
                            _ => return,
                        }
                    };
                    info!(
                        test_id = %test_id,
                        agents = targets.len(),
                        "All agents ready, broadcasting start"
                    );
                    service.broadcast(&test_id, "start", targets).await;
                    return;
                }

                debug!(
                    test_id = %test_id,
                    ready,
                    expected = expected_agents,
                    "Not all agents ready, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(COORDINATION_INTERVAL) => {}
                    _ = service.inner.shutdown.cancelled() => return,
                }
            }
        });
    }

    /// One `/ready` round over a bounded pool within a 5 s budget.
    /// Returns how many agents answered 200.
    async fn ready_round(&self, test_id: &str, agents: Vec<AgentInfo>) -> usize {
        let client = self.inner.client.clone();
        let test_id = test_id.to_string();
        let limit = pool_size(agents.len());

        let round = run_bounded(agents, limit, move |agent| {
            let client = client.clone();
            let endpoint = format!(
                "{}/ready?test_id={}&agent_id={}",
                agent.callback.trim_end_matches('/'),
                test_id,
                agent.id
            );
            async move {
                client
                    .post(&endpoint)
                    .send()
                    .await
                    .map(|response| response.status().is_success())
                    .unwrap_or(false)
            }
        });

        match tokio::time::timeout(READY_ROUND_BUDGET, round).await {
            Ok(results) => results.into_iter().filter(|ok| *ok).count(),
            Err(_) => 0,
        }
    }

    /// Liveness: while the session is pending, ping each admitted agent
    /// every 5 s and evict the ones that fail, freeing their slot for
    /// re-registration.
    fn spawn_liveness_loop(&self, test_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(COORDINATION_INTERVAL) => {}
                    _ = service.inner.shutdown.cancelled() => return,
                }

                let agents = {
                    let store = service.inner.store.lock().unwrap();
                    match store.sessions.get(&test_id) {
                        Some(session) if session.state == SessionState::Pending => {
                            session.agents.values().cloned().collect::<Vec<_>>()
                        }
                        Some(session) if session.state == SessionState::Running => {
                            // The running phase is observed through reports.
                            continue;
                        }
                        _ => return,
                    }
                };
                if agents.is_empty() {
                    continue;
                }

                let client = service.inner.client.clone();
                let ping_test_id = test_id.clone();
                let limit = pool_size(agents.len());
                let results = run_bounded(agents, limit, move |agent| {
                    let client = client.clone();
                    let endpoint = format!(
                        "{}/ping?test_id={}&agent_id={}",
                        agent.callback.trim_end_matches('/'),
                        ping_test_id,
                        agent.id
                    );
                    async move {
                        let ok = client
                            .post(&endpoint)
                            .send()
                            .await
                            .map(|response| response.status().is_success())
                            .unwrap_or(false);
                        (agent.id, ok)
                    }
                })
                .await;

                let failed: Vec<String> = results
                    .into_iter()
                    .filter(|(_, ok)| !ok)
                    .map(|(id, _)| id)
                    .collect();
                if failed.is_empty() {
                    continue;
                }

                let mut store = service.inner.store.lock().unwrap();
                if let Some(session) = store.sessions.get_mut(&test_id) {
                    for agent_id in failed {
                        session.evict(&agent_id);
                    }
                }
            }
        });
    }

    /// Fires one signal at every target through a bounded pool. Failures
    /// are logged; delivery is best-effort.
    async fn broadcast(&self, test_id: &str, signal: &str, targets: Vec<AgentInfo>) {
        if targets.is_empty() {
            return;
        }

        let client = self.inner.client.clone();
        let test_id = test_id.to_string();
        let signal_name = signal.to_string();
        let limit = pool_size(targets.len());

        let results = run_bounded(targets, limit, move |agent| {
            let client = client.clone();
            let endpoint = format!(
                "{}/{}?test_id={}&agent_id={}",
                agent.callback.trim_end_matches('/'),
                signal_name,
                test_id,
                agent.id
            );
            let signal_name = signal_name.clone();
            async move {
                match client.post(&endpoint).send().await {
                    Ok(response) if response.status().is_success() => true,
                    Ok(response) => {
                        warn!(
                            signal = %signal_name,
                            agent_id = %agent.id,
                            status = response.status().as_u16(),
                            "Agent refused signal"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            signal = %signal_name,
                            agent_id = %agent.id,
                            error = %e,
                            "Signal delivery failed"
                        );
                        false
                    }
                }
            }
        })
        .await;

        let delivered = results.iter().filter(|ok| **ok).count();
        debug!(signal, delivered, total = results.len(), "Signal broadcast done");
    }

    // ── HTTP listener ────────────────────────────────────────────────────

    /// Binds and serves the collector HTTP surface (port 0 picks an
    /// ephemeral one). Shutdown drains in-flight requests.
    pub fn start(&self, addr: SocketAddr) -> Result<CollectorServer, CollectorError> {
        let service = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let service = service.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let service = service.clone();
                    async move { collector_handler(req, service).await }
                }))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);
        let local_addr = server.local_addr();
        let shutdown = self.inner.shutdown.clone();
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });

        info!(addr = %local_addr, "Collector listening");

        let task = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!(error = %e, "Collector server error");
            }
        });

        Ok(CollectorServer {
            addr: local_addr,
            task,
        })
    }
}

async fn collector_handler(
    req: Request<Body>,
    service: CollectorService,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let query = parse_query(req.uri().query().unwrap_or(""));

    match (method, segments.as_slice()) {
        (Method::POST, ["tests"]) => {
            let agent_num = query
                .get("agent_num")
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0);
            if agent_num == 0 {
                return Ok(plain_response(
                    StatusCode::BAD_REQUEST,
                    "agent_num must be a positive integer",
                ));
            }
            json_ok(&service.create_session(agent_num))
        }
        (Method::POST, ["register"]) => {
            let info: AgentInfo = match read_json(req.into_body()).await {
                Ok(info) => info,
                Err(message) => return Ok(plain_response(StatusCode::BAD_REQUEST, &message)),
            };
            match service.register_agent(info) {
                Ok(response) => json_ok(&response),
                Err(RegisterRejection::Conflict(message)) => {
                    Ok(plain_response(StatusCode::CONFLICT, &message))
                }
                Err(RegisterRejection::Unavailable(message)) => {
                    Ok(plain_response(StatusCode::SERVICE_UNAVAILABLE, &message))
                }
            }
        }
        (Method::POST, ["tests", test_id, "report"]) => {
            let test_id = test_id.to_string();
            let report: StatsSnapshot = match read_json(req.into_body()).await {
                Ok(report) => report,
                Err(message) => return Ok(plain_response(StatusCode::BAD_REQUEST, &message)),
            };
            if service.ingest_report(&test_id, report) {
                Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string()))
            } else {
                Ok(plain_response(StatusCode::NOT_FOUND, "unknown test session"))
            }
        }
        (Method::GET, ["tests", test_id, "report"]) => match service.report_view(test_id) {
            Some(view) => json_ok(&view),
            None => Ok(plain_response(StatusCode::NOT_FOUND, "unknown test session")),
        },
        (Method::POST, ["tests", test_id, "stop"]) => {
            if service.stop_session(test_id).await {
                Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string()))
            } else {
                Ok(plain_response(StatusCode::NOT_FOUND, "unknown test session"))
            }
        }
        (Method::POST, ["ping", test_id]) => {
            let agent_id = query.get("agent_id").map(String::as_str).unwrap_or("");
            let status = service.agent_ping(test_id, agent_id);
            if status == StatusCode::OK {
                Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string()))
            } else {
                Ok(plain_response(status, "ping rejected"))
            }
        }
        _ => Ok(plain_response(StatusCode::NOT_FOUND, "not found")),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(body: Body) -> Result<T, String> {
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|e| format!("failed to read body: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {}", e))
}

fn json_ok<T: Serialize>(value: &T) -> Result<Response<Body>, hyper::Error> {
    match serde_json::to_string(value) {
        Ok(body) => Ok(json_response(StatusCode::OK, body)),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization failure",
            ))
        }
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
