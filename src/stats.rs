//! Streaming statistics over a result stream.
//!
//! A [`StatsCollector`] is owned by exactly one task per engine run: the
//! collector task drains the result channel, updates running counters and a
//! latency reservoir, and periodically emits snapshots to the push sink.
//! It is discarded after the final report is produced.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::push::PushSink;

/// A single measured request outcome. Created per attempt, consumed once
/// by the statistics collector, never stored.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub duration: Duration,
    /// Request bytes sent (body size).
    pub sent: u64,
    /// Response bytes received (body size).
    pub received: u64,
    /// HTTP status code; 0 when the transport failed.
    pub status: u16,
    pub error: Option<String>,
}

impl RequestResult {
    /// A non-nil error or a status outside [200, 300) marks failure.
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status < 200 || self.status >= 300
    }
}

/// Lifecycle tag carried in every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Stopped => "stopped",
        }
    }
}

/// An immutable statistical summary of a run's progress or final state.
///
/// This is also the wire payload ingested by the collector's report
/// endpoint and emitted to push sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub id: String,
    pub url: String,
    pub method: String,
    /// Wall-clock seconds covered by this snapshot.
    pub total_duration: f64,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub qps: f64,
    pub avg_latency: f64,
    pub p25_latency: f64,
    pub p50_latency: f64,
    pub p95_latency: f64,
    pub p99_latency: f64,
    pub max_latency: f64,
    pub min_latency: f64,
    pub total_sent: u64,
    pub total_received: u64,
    pub status_codes: HashMap<u16, u64>,
    pub created_at: String,
    pub status: String,
    pub agent_id: String,
    pub errors: Vec<String>,
}

impl StatsSnapshot {
    /// Writes the snapshot as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

/// Identity attached to every snapshot a collector produces.
#[derive(Debug, Clone, Default)]
pub struct StatsIdentity {
    pub test_id: String,
    pub agent_id: String,
    pub url: String,
    pub method: String,
}

/// Initial reservoir capacity when the total is unknown (fixed-duration
/// mode); grows amortized from there.
const UNBOUNDED_RESERVOIR_CAPACITY: usize = 100_000;

/// Running counters and latency reservoir for one engine run.
pub struct StatsCollector {
    identity: StatsIdentity,
    started: Instant,
    total_requests: u64,
    success_count: u64,
    error_count: u64,
    total_sent: u64,
    total_received: u64,
    min_latency: f64,
    max_latency: f64,
    latency_sum: f64,
    /// Latency samples in fractional milliseconds.
    reservoir: Vec<f64>,
    status_codes: HashMap<u16, u64>,
    /// Error messages in first-seen order, deduplicated by message.
    errors: Vec<String>,
    seen_errors: HashSet<String>,
}

impl StatsCollector {
    /// Creates a collector. `expected_total > 0` pre-sizes the reservoir;
    /// 0 selects the amortized-growth buffer.
    pub fn new(identity: StatsIdentity, expected_total: u64) -> Self {
        let capacity = if expected_total > 0 {
            expected_total as usize
        } else {
            UNBOUNDED_RESERVOIR_CAPACITY
        };

        Self {
            identity,
            started: Instant::now(),
            total_requests: 0,
            success_count: 0,
            error_count: 0,
            total_sent: 0,
            total_received: 0,
            min_latency: f64::INFINITY,
            max_latency: 0.0,
            latency_sum: 0.0,
            reservoir: Vec::with_capacity(capacity),
            status_codes: HashMap::new(),
            errors: Vec::new(),
            seen_errors: HashSet::new(),
        }
    }

    /// Folds one result into the running state.
    pub fn record(&mut self, result: RequestResult) {
        let latency_ms = result.duration.as_secs_f64() * 1000.0;

        self.total_requests += 1;
        if result.is_failure() {
            self.error_count += 1;
        } else {
            self.success_count += 1;
        }
        self.total_sent += result.sent;
        self.total_received += result.received;

        self.latency_sum += latency_ms;
        if latency_ms < self.min_latency {
            self.min_latency = latency_ms;
        }
        if latency_ms > self.max_latency {
            self.max_latency = latency_ms;
        }
        self.reservoir.push(latency_ms);

        if result.status > 0 {
            *self.status_codes.entry(result.status).or_insert(0) += 1;
        }

        if let Some(message) = result.error {
            if self.seen_errors.insert(message.clone()) {
                self.errors.push(message);
            }
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Produces a consistent snapshot of the current state.
    pub fn snapshot(&self, status: RunStatus) -> StatsSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();

        let qps = if elapsed > 0.0 {
            round1(self.total_requests as f64 / elapsed)
        } else {
            0.0
        };
        let avg_latency = if self.total_requests > 0 {
            round2(self.latency_sum / self.total_requests as f64)
        } else {
            0.0
        };
        let min_latency = if self.min_latency.is_finite() {
            round2(self.min_latency)
        } else {
            0.0
        };

        let mut sorted = self.reservoir.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        StatsSnapshot {
            id: self.identity.test_id.clone(),
            url: self.identity.url.clone(),
            method: self.identity.method.clone(),
            total_duration: round2(elapsed),
            total_requests: self.total_requests,
            success_count: self.success_count,
            error_count: self.error_count,
            qps,
            avg_latency,
            p25_latency: round2(percentile(&sorted, 0.25)),
            p50_latency: round2(percentile(&sorted, 0.50)),
            p95_latency: round2(percentile(&sorted, 0.95)),
            p99_latency: round2(percentile(&sorted, 0.99)),
            max_latency: round2(self.max_latency),
            min_latency,
            total_sent: self.total_sent,
            total_received: self.total_received,
            status_codes: self.status_codes.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            status: status.as_str().to_string(),
            agent_id: self.identity.agent_id.clone(),
            errors: self.errors.clone(),
        }
    }
}

/// Percentile over an ascending-sorted slice: index `⌊n·q⌋`, clamped.
/// Ties resolve to the lower index; an empty slice yields 0.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * q) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub(crate) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Drains the result channel into `collector`, pushing a running snapshot
/// every `push_interval` when a sink is configured. Returns the collector
/// once the channel closes; the caller decides the terminal status.
pub async fn run_stats_loop(
    mut collector: StatsCollector,
    mut results: mpsc::Receiver<RequestResult>,
    sink: Option<PushSink>,
    push_interval: Duration,
) -> StatsCollector {
    let mut ticker = interval(push_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            received = results.recv() => {
                match received {
                    Some(result) => collector.record(result),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if let Some(sink) = &sink {
                    let snapshot = collector.snapshot(RunStatus::Running);
                    debug!(
                        total = snapshot.total_requests,
                        qps = snapshot.qps,
                        "Pushing running snapshot"
                    );
                    sink.push(&snapshot).await;
                }
            }
        }
    }

    collector
}
