//! Load-generation engine.
//!
//! Drives N concurrent workers issuing requests through one shared HTTP
//! client until a fixed total request count or a fixed wall-clock duration
//! is reached, or the run token is cancelled. Workers emit one
//! [`RequestResult`] per attempt into a bounded channel drained by the
//! statistics task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{build_client, build_control_client, ClientError, RequestParams};
use crate::push::PushSink;
use crate::stats::{run_stats_loop, RequestResult, RunStatus, StatsCollector, StatsIdentity, StatsSnapshot};

/// Errors that terminate an engine run before or after load generation.
/// Transport failures during load are recorded as results, never raised.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid engine parameters: {0}")]
    Validation(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Engine internal failure: {0}")]
    Internal(String),
}

/// Extra slack after a fixed-duration deadline so in-flight results land
/// before the result channel closes.
const DURATION_GRACE: Duration = Duration::from_millis(500);

/// One load-test execution: target, termination policy and telemetry.
pub struct LoadEngine {
    pub params: RequestParams,
    /// Concurrent workers; must be at least 1.
    pub workers: usize,
    /// Total requests in fixed-count mode; 0 in fixed-duration mode.
    pub total: u64,
    /// Wall-clock limit in fixed-duration mode; zero in fixed-count mode.
    pub duration: Duration,
    /// Telemetry sink URL; empty disables pushes.
    pub push_url: String,
    /// Non-empty treats `push_url` as a Prometheus gateway.
    pub prometheus_job_name: String,
    /// Cadence of running-snapshot pushes.
    pub push_interval: Duration,
    /// Identity stamped on every snapshot.
    pub identity: StatsIdentity,
    /// Optional path for the final report JSON.
    pub output_path: Option<PathBuf>,
}

impl LoadEngine {
    /// Checks parameter combinations before any task is spawned.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Validation(
                "worker count must be at least 1".to_string(),
            ));
        }

        let fixed_count = self.total > 0;
        let fixed_duration = self.duration > Duration::ZERO;
        if fixed_count == fixed_duration {
            return Err(EngineError::Validation(
                "exactly one of total or duration must be set".to_string(),
            ));
        }

        if self.push_interval < Duration::from_millis(100)
            || self.push_interval > Duration::from_secs(10)
        {
            return Err(EngineError::Validation(format!(
                "push interval must be within [100ms, 10s], got {:?}",
                self.push_interval
            )));
        }

        if !self.prometheus_job_name.is_empty() && self.push_url.is_empty() {
            return Err(EngineError::Validation(
                "a Prometheus job name requires a push URL".to_string(),
            ));
        }

        Ok(())
    }

    /// Runs the load test to completion and returns the final snapshot.
    ///
    /// Cancelling `cancel` stops workers within one iteration; in-flight
    /// requests complete naturally (the client enforces a 15 s cap). The
    /// final snapshot is tagged `stopped` when the run was cancelled,
    /// `finished` otherwise.
    pub async fn run(&self, cancel: CancellationToken) -> Result<StatsSnapshot, EngineError> {
        self.validate()?;

        let client = build_client(self.params.protocol, self.workers)?;
        let sink = if self.push_url.is_empty() {
            None
        } else {
            Some(PushSink::new(
                build_control_client(Duration::from_secs(5))?,
                self.push_url.clone(),
                self.prometheus_job_name.clone(),
            ))
        };

        let fixed_duration = self.duration > Duration::ZERO;
        let collector = StatsCollector::new(self.identity.clone(), self.total);

        let (result_tx, result_rx) = mpsc::channel::<RequestResult>(self.workers * 3);
        let stats_task = tokio::spawn(run_stats_loop(
            collector,
            result_rx,
            sink.clone(),
            self.push_interval,
        ));

        info!(
            url = %self.params.url,
            method = %self.params.method,
            workers = self.workers,
            total = self.total,
            duration_secs = self.duration.as_secs_f64(),
            "Engine starting"
        );

        // Workers observe a child token so a duration deadline can stop
        // them without marking the run as externally stopped.
        let worker_cancel = cancel.child_token();

        // Remaining-token budget for fixed-count mode; fixed-duration
        // workers run until the token fires.
        let budget = Arc::new(AtomicU64::new(self.total));

        let mut workers: JoinSet<()> = JoinSet::new();
        for worker_id in 0..self.workers {
            let client = client.clone();
            let params = self.params.clone();
            let result_tx = result_tx.clone();
            let cancel = worker_cancel.clone();
            let budget = if fixed_duration {
                None
            } else {
                Some(budget.clone())
            };

            workers.spawn(async move {
                run_worker(worker_id, client, params, result_tx, cancel, budget).await;
            });
        }
        drop(result_tx);

        if fixed_duration {
            tokio::select! {
                _ = tokio::time::sleep(self.duration) => {
                    debug!("Duration limit reached, stopping workers");
                }
                _ = cancel.cancelled() => {
                    debug!("Run cancelled before duration limit");
                }
            }
            worker_cancel.cancel();
            tokio::time::sleep(DURATION_GRACE).await;
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                // A panicking worker must not take the run down.
                error!(error = %e, "Worker task aborted");
            }
        }

        let collector = match stats_task.await {
            Ok(collector) => collector,
            Err(e) => {
                error!(error = %e, "Statistics task aborted");
                return Err(EngineError::Internal("statistics task aborted".to_string()));
            }
        };

        let status = if cancel.is_cancelled() {
            RunStatus::Stopped
        } else {
            RunStatus::Finished
        };
        let snapshot = collector.snapshot(status);

        if let Some(sink) = &sink {
            sink.push(&snapshot).await;
        }
        if let Some(path) = &self.output_path {
            if let Err(e) = snapshot.save(path) {
                warn!(path = %path.display(), error = %e, "Failed to save report");
            } else {
                info!(path = %path.display(), "Report saved");
            }
        }

        info!(
            total = snapshot.total_requests,
            success = snapshot.success_count,
            errors = snapshot.error_count,
            qps = snapshot.qps,
            status = %snapshot.status,
            "Engine finished"
        );

        Ok(snapshot)
    }
}

/// Worker loop: take a token (fixed-count) or poll the cancel flag
/// (fixed-duration), issue one request, emit its result, repeat.
async fn run_worker(
    worker_id: usize,
    client: reqwest::Client,
    params: RequestParams,
    result_tx: mpsc::Sender<RequestResult>,
    cancel: CancellationToken,
    budget: Option<Arc<AtomicU64>>,
) {
    debug!(worker_id, "Worker starting");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Some(budget) = &budget {
            let taken = budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if !taken {
                break;
            }
        }

        let result = issue_request(&client, &params).await;

        // The channel only closes when the statistics task is gone, at
        // which point results have nowhere to go.
        if result_tx.send(result).await.is_err() {
            break;
        }
    }

    debug!(worker_id, "Worker stopping");
}

/// Issues one request and measures it. Transport errors become failure
/// results; non-2xx statuses get a synthetic error message.
async fn issue_request(client: &reqwest::Client, params: &RequestParams) -> RequestResult {
    let mut request = client
        .request(params.method.clone(), &params.url)
        .headers(params.headers.clone());

    let mut sent = 0u64;
    if params.sends_body() {
        sent = params.body.len() as u64;
        request = request.body(params.body.clone());
    }

    let start = Instant::now();

    match request.send().await {
        Err(e) => RequestResult {
            duration: start.elapsed(),
            sent,
            received: 0,
            status: 0,
            error: Some(e.to_string()),
        },
        Ok(mut response) => {
            let status = response.status();

            // Drain the body in chunks; buffering whole bodies at high
            // request rates exhausts memory.
            let mut received = 0u64;
            while let Ok(Some(chunk)) = response.chunk().await {
                received += chunk.len() as u64;
            }

            let duration = start.elapsed();
            let error = if status.is_success() {
                None
            } else {
                Some(format!(
                    "{}, [{}] {}",
                    status.canonical_reason().unwrap_or("Unknown Status"),
                    params.method,
                    params.url
                ))
            };

            RequestResult {
                duration,
                sent,
                received,
                status: status.as_u16(),
                error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Protocol;

    fn params() -> RequestParams {
        RequestParams::new("http://localhost/x", "GET", &[], Vec::new(), Protocol::Http).unwrap()
    }

    fn engine() -> LoadEngine {
        LoadEngine {
            params: params(),
            workers: 2,
            total: 10,
            duration: Duration::ZERO,
            push_url: String::new(),
            prometheus_job_name: String::new(),
            push_interval: Duration::from_secs(1),
            identity: StatsIdentity::default(),
            output_path: None,
        }
    }

    #[test]
    fn test_validate_accepts_fixed_count() {
        assert!(engine().validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_fixed_duration() {
        let mut e = engine();
        e.total = 0;
        e.duration = Duration::from_secs(1);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut e = engine();
        e.workers = 0;
        assert!(matches!(e.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_both_modes() {
        let mut e = engine();
        e.duration = Duration::from_secs(1);
        assert!(e.validate().is_err());

        let mut e = engine();
        e.total = 0;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_validate_push_interval_bounds() {
        let mut e = engine();
        e.push_interval = Duration::from_millis(50);
        assert!(e.validate().is_err());

        e.push_interval = Duration::from_secs(11);
        assert!(e.validate().is_err());

        e.push_interval = Duration::from_millis(100);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate_prometheus_needs_push_url() {
        let mut e = engine();
        e.prometheus_job_name = "swarm".to_string();
        assert!(e.validate().is_err());

        e.push_url = "http://gateway:9091".to_string();
        assert!(e.validate().is_ok());
    }
}
