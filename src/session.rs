//! Test sessions: the collector's unit of coordination.
//!
//! A session is a logical test with a unique id, an expected agent count,
//! a shared target fixed by its first-registered agent, and a single state
//! machine. Sessions own their agent records and reports; all mutation
//! happens under the collector's session lock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::stats::{round1, round2, StatsSnapshot};

/// Session lifecycle.
///
/// Transitions are monotonic:
/// ```text
/// pending → running → completed
/// pending → running → stopped
/// pending → aborted
/// pending → stopped        (external stop before start)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Running,
    Stopped,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }

    /// Once terminal, no further session state mutates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::Completed | SessionState::Aborted
        )
    }
}

/// A registered agent within a session. `id` and `callback` are unique
/// per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    /// Base URL at which the agent's control endpoints are reachable.
    pub callback: String,
    /// Target URL the agent will load.
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// Why an agent could not be admitted to a session.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("agent id '{0}' is already registered in this session")]
    DuplicateAgent(String),

    #[error("callback '{0}' is already registered in this session")]
    DuplicateCallback(String),

    #[error("target mismatch: session runs [{method}] {url}")]
    TargetMismatch { method: String, url: String },

    #[error("session already has its expected agents")]
    Full,
}

/// One logical test run coordinated across several agents.
#[derive(Debug, Clone)]
pub struct TestSession {
    pub test_id: String,
    pub expected_agents: usize,
    pub state: SessionState,
    pub agents: HashMap<String, AgentInfo>,
    /// Registration order; the first entry fixes the session target.
    agent_order: Vec<String>,
    /// Latest running report per agent; overwritten on every push.
    pub live_reports: HashMap<String, StatsSnapshot>,
    /// Terminal report per agent; first write wins.
    pub final_reports: HashMap<String, StatsSnapshot>,
    pub aggregated: Option<StatsSnapshot>,
    pub created_at: DateTime<Utc>,
}

impl TestSession {
    pub fn new(test_id: impl Into<String>, expected_agents: usize) -> Self {
        Self {
            test_id: test_id.into(),
            expected_agents,
            state: SessionState::Pending,
            agents: HashMap::new(),
            agent_order: Vec::new(),
            live_reports: HashMap::new(),
            final_reports: HashMap::new(),
            aggregated: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.agents.len() >= self.expected_agents
    }

    /// The agent whose registration fixed this session's target.
    pub fn first_agent(&self) -> Option<&AgentInfo> {
        self.agent_order.first().and_then(|id| self.agents.get(id))
    }

    /// Whether `(url, method)` matches the session target. An empty
    /// session has no target yet and matches anything.
    pub fn target_matches(&self, url: &str, method: &str) -> bool {
        match self.first_agent() {
            Some(first) => first.url == url && first.method == method,
            None => true,
        }
    }

    /// Admits an agent. The caller has already chosen this session via
    /// the matchmaking rules; this enforces the session-local invariants.
    pub fn admit(&mut self, mut info: AgentInfo) -> Result<(), AdmissionError> {
        if self.agents.contains_key(&info.id) {
            return Err(AdmissionError::DuplicateAgent(info.id));
        }
        if self.agents.values().any(|agent| agent.callback == info.callback) {
            return Err(AdmissionError::DuplicateCallback(info.callback));
        }
        if !self.target_matches(&info.url, &info.method) {
            let first = self.first_agent().expect("non-empty session has a target");
            return Err(AdmissionError::TargetMismatch {
                method: first.method.clone(),
                url: first.url.clone(),
            });
        }
        if self.is_full() {
            return Err(AdmissionError::Full);
        }

        info.status = "registered".to_string();
        self.agent_order.push(info.id.clone());
        info!(
            test_id = %self.test_id,
            agent_id = %info.id,
            callback = %info.callback,
            agents = self.agents.len() + 1,
            expected = self.expected_agents,
            "Agent admitted"
        );
        self.agents.insert(info.id.clone(), info);
        Ok(())
    }

    /// Removes an agent that stopped answering pings. Its reports are
    /// kept so a partially delivered contribution stays in the aggregate.
    pub fn evict(&mut self, agent_id: &str) {
        if self.agents.remove(agent_id).is_some() {
            self.agent_order.retain(|id| id != agent_id);
            warn!(
                test_id = %self.test_id,
                agent_id = %agent_id,
                "Agent evicted from session"
            );
        }
    }

    /// Applies a monotonic state transition. Backward or post-terminal
    /// transitions are refused.
    pub fn transition(&mut self, new_state: SessionState) -> bool {
        if self.state == new_state {
            return true;
        }
        if self.state.is_terminal() {
            warn!(
                test_id = %self.test_id,
                from = self.state.as_str(),
                to = new_state.as_str(),
                "Refusing transition out of terminal state"
            );
            return false;
        }
        let allowed = match (self.state, new_state) {
            (SessionState::Pending, SessionState::Running)
            | (SessionState::Pending, SessionState::Aborted)
            | (SessionState::Pending, SessionState::Stopped)
            | (SessionState::Running, SessionState::Completed)
            | (SessionState::Running, SessionState::Stopped) => true,
            _ => false,
        };
        if allowed {
            info!(
                test_id = %self.test_id,
                from = self.state.as_str(),
                to = new_state.as_str(),
                "Session state changed"
            );
            self.state = new_state;
        } else {
            warn!(
                test_id = %self.test_id,
                from = self.state.as_str(),
                to = new_state.as_str(),
                "Refusing backward session transition"
            );
        }
        allowed
    }

    /// Agent ids that have not delivered a final report yet.
    pub fn agents_without_final(&self) -> Vec<AgentInfo> {
        self.agent_order
            .iter()
            .filter(|id| !self.final_reports.contains_key(*id))
            .filter_map(|id| self.agents.get(id))
            .cloned()
            .collect()
    }

    /// Ingests one report, recomputes the aggregate, and applies the
    /// completion transition when every expected final has arrived.
    pub fn ingest_report(&mut self, agent_id: &str, report: StatsSnapshot) {
        match report.status.as_str() {
            "finished" | "stopped" => {
                // First write wins; duplicate finals are ignored.
                if self.final_reports.contains_key(agent_id) {
                    warn!(
                        test_id = %self.test_id,
                        agent_id = %agent_id,
                        "Duplicate final report ignored"
                    );
                } else {
                    if let Some(agent) = self.agents.get_mut(agent_id) {
                        agent.status = report.status.clone();
                    }
                    self.final_reports.insert(agent_id.to_string(), report);
                }
            }
            _ => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.status = report.status.clone();
                }
                self.live_reports.insert(agent_id.to_string(), report);
            }
        }

        self.recompute_aggregate();

        if self.final_reports.len() >= self.expected_agents && !self.state.is_terminal() {
            let all_finished = self
                .final_reports
                .values()
                .all(|report| report.status == "finished");
            let terminal = if all_finished {
                SessionState::Completed
            } else {
                SessionState::Stopped
            };
            // A session that was never started can still complete if its
            // agents ran to the end.
            if self.state == SessionState::Pending {
                self.transition(SessionState::Running);
            }
            self.transition(terminal);
        }
    }

    /// The report considered current for an agent: final if present,
    /// else the latest live one.
    fn current_report(&self, agent_id: &str) -> Option<&StatsSnapshot> {
        self.final_reports
            .get(agent_id)
            .or_else(|| self.live_reports.get(agent_id))
    }

    /// Recomputes the aggregated snapshot from all current reports.
    ///
    /// Percentiles are the arithmetic mean of the per-agent percentiles,
    /// an approximation, accepted for cross-agent reports that do not
    /// carry raw reservoirs.
    fn recompute_aggregate(&mut self) {
        let mut reporting_ids: Vec<String> = self
            .final_reports
            .keys()
            .chain(self.live_reports.keys())
            .cloned()
            .collect();
        reporting_ids.sort();
        reporting_ids.dedup();

        if reporting_ids.is_empty() {
            self.aggregated = None;
            return;
        }

        let reports: Vec<(&str, &StatsSnapshot)> = reporting_ids
            .iter()
            .filter_map(|id| self.current_report(id).map(|r| (id.as_str(), r)))
            .collect();

        let mut aggregate = StatsSnapshot {
            id: self.test_id.clone(),
            url: String::new(),
            method: String::new(),
            total_duration: 0.0,
            total_requests: 0,
            success_count: 0,
            error_count: 0,
            qps: 0.0,
            avg_latency: 0.0,
            p25_latency: 0.0,
            p50_latency: 0.0,
            p95_latency: 0.0,
            p99_latency: 0.0,
            max_latency: 0.0,
            min_latency: 0.0,
            total_sent: 0,
            total_received: 0,
            status_codes: HashMap::new(),
            created_at: Utc::now().to_rfc3339(),
            status: String::new(),
            agent_id: String::new(),
            errors: Vec::new(),
        };

        if let Some((_, first)) = reports.first() {
            aggregate.url = first.url.clone();
            aggregate.method = first.method.clone();
        }

        let mut latency_weight = 0.0;
        let mut min_latency = f64::INFINITY;
        let mut error_order: Vec<String> = Vec::new();
        let mut error_agents: HashMap<String, Vec<String>> = HashMap::new();
        let mut status_map: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (agent_id, report) in &reports {
            aggregate.total_requests += report.total_requests;
            aggregate.success_count += report.success_count;
            aggregate.error_count += report.error_count;
            aggregate.total_sent += report.total_sent;
            aggregate.total_received += report.total_received;
            aggregate.qps += report.qps;
            aggregate.total_duration = aggregate.total_duration.max(report.total_duration);

            latency_weight += report.avg_latency * report.total_requests as f64;
            aggregate.p25_latency += report.p25_latency;
            aggregate.p50_latency += report.p50_latency;
            aggregate.p95_latency += report.p95_latency;
            aggregate.p99_latency += report.p99_latency;
            aggregate.max_latency = aggregate.max_latency.max(report.max_latency);
            if report.total_requests > 0 {
                min_latency = min_latency.min(report.min_latency);
            }

            for (code, count) in &report.status_codes {
                *aggregate.status_codes.entry(*code).or_insert(0) += count;
            }

            for message in &report.errors {
                let ids = error_agents.entry(message.clone()).or_default();
                if ids.is_empty() {
                    error_order.push(message.clone());
                }
                ids.push((*agent_id).to_string());
            }

            status_map
                .entry(report.status.clone())
                .or_default()
                .push((*agent_id).to_string());
        }

        let agent_count = reports.len() as f64;
        aggregate.qps = round1(aggregate.qps);
        aggregate.avg_latency = if aggregate.total_requests > 0 {
            round2(latency_weight / aggregate.total_requests as f64)
        } else {
            0.0
        };
        aggregate.p25_latency = round2(aggregate.p25_latency / agent_count);
        aggregate.p50_latency = round2(aggregate.p50_latency / agent_count);
        aggregate.p95_latency = round2(aggregate.p95_latency / agent_count);
        aggregate.p99_latency = round2(aggregate.p99_latency / agent_count);
        aggregate.min_latency = if min_latency.is_finite() {
            min_latency
        } else {
            0.0
        };

        for message in error_order {
            let mut ids = error_agents.remove(&message).unwrap_or_default();
            ids.sort();
            ids.dedup();
            aggregate
                .errors
                .push(format!("{} (agents: {})", message, ids.join(", ")));
        }

        for ids in status_map.values_mut() {
            ids.sort();
        }
        aggregate.status =
            serde_json::to_string(&status_map).unwrap_or_else(|_| "{}".to_string());

        self.aggregated = Some(aggregate);
    }
}
