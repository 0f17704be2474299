//! Snapshot push sink.
//!
//! During a run the statistics task emits a snapshot at a fixed interval;
//! on termination the engine emits one final snapshot. The sink either
//! POSTs the snapshot as JSON, or serializes the same metrics as
//! text-format exposition pushed to a gateway when a Prometheus job name
//! is configured. Push failures are logged and never affect the run.

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

use crate::stats::StatsSnapshot;

const METRIC_NAMESPACE: &str = "loadswarm";

/// Where terminal and periodic snapshots go.
#[derive(Debug, Clone)]
pub struct PushSink {
    client: reqwest::Client,
    url: String,
    /// Non-empty selects Prometheus gateway mode.
    job_name: String,
}

impl PushSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            job_name: job_name.into(),
        }
    }

    /// Emits one snapshot. Errors are logged, not returned.
    pub async fn push(&self, snapshot: &StatsSnapshot) {
        let outcome = if self.job_name.is_empty() {
            self.push_json(snapshot).await
        } else {
            self.push_prometheus(snapshot).await
        };

        match outcome {
            Ok(status) if status.is_success() => {
                debug!(url = %self.url, "Snapshot pushed");
            }
            Ok(status) => {
                warn!(url = %self.url, status = status.as_u16(), "Push sink rejected snapshot");
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Snapshot push failed");
            }
        }
    }

    async fn push_json(&self, snapshot: &StatsSnapshot) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self.client.post(&self.url).json(snapshot).send().await?;
        Ok(response.status())
    }

    async fn push_prometheus(
        &self,
        snapshot: &StatsSnapshot,
    ) -> Result<reqwest::StatusCode, reqwest::Error> {
        let body = match encode_exposition(snapshot) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to encode Prometheus exposition");
                return Ok(reqwest::StatusCode::OK);
            }
        };

        let gateway = format!(
            "{}/metrics/job/{}/instance/{}",
            self.url.trim_end_matches('/'),
            self.job_name,
            snapshot.agent_id
        );

        let response = self
            .client
            .put(&gateway)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(body)
            .send()
            .await?;
        Ok(response.status())
    }
}

/// Serializes one snapshot into Prometheus text format using a one-shot
/// registry.
fn encode_exposition(snapshot: &StatsSnapshot) -> Result<Vec<u8>, prometheus::Error> {
    let registry = Registry::new();

    let scalar = |name: &str, help: &str, value: f64| -> Result<(), prometheus::Error> {
        let gauge = Gauge::with_opts(Opts::new(name, help).namespace(METRIC_NAMESPACE))?;
        gauge.set(value);
        registry.register(Box::new(gauge))
    };

    scalar(
        "total_requests",
        "Total number of requests issued",
        snapshot.total_requests as f64,
    )?;
    scalar(
        "success_count",
        "Number of successful requests",
        snapshot.success_count as f64,
    )?;
    scalar(
        "error_count",
        "Number of failed requests",
        snapshot.error_count as f64,
    )?;
    scalar("qps", "Requests per second", snapshot.qps)?;
    scalar(
        "avg_latency_ms",
        "Average request latency in milliseconds",
        snapshot.avg_latency,
    )?;
    scalar("p25_latency_ms", "25th percentile latency", snapshot.p25_latency)?;
    scalar("p50_latency_ms", "50th percentile latency", snapshot.p50_latency)?;
    scalar("p95_latency_ms", "95th percentile latency", snapshot.p95_latency)?;
    scalar("p99_latency_ms", "99th percentile latency", snapshot.p99_latency)?;
    scalar("max_latency_ms", "Maximum latency", snapshot.max_latency)?;
    scalar("min_latency_ms", "Minimum latency", snapshot.min_latency)?;
    scalar(
        "total_sent_bytes",
        "Total request bytes sent",
        snapshot.total_sent as f64,
    )?;
    scalar(
        "total_received_bytes",
        "Total response bytes received",
        snapshot.total_received as f64,
    )?;
    scalar(
        "total_duration_seconds",
        "Wall-clock duration of the run",
        snapshot.total_duration,
    )?;

    let status_codes = GaugeVec::new(
        Opts::new("status_codes_total", "Responses by HTTP status code")
            .namespace(METRIC_NAMESPACE),
        &["status_code"],
    )?;
    for (code, count) in &snapshot.status_codes {
        status_codes
            .with_label_values(&[&code.to_string()])
            .set(*count as f64);
    }
    registry.register(Box::new(status_codes))?;

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot() -> StatsSnapshot {
        StatsSnapshot {
            id: "tid_x".to_string(),
            url: "http://target/x".to_string(),
            method: "GET".to_string(),
            total_duration: 1.5,
            total_requests: 10,
            success_count: 9,
            error_count: 1,
            qps: 6.7,
            avg_latency: 12.34,
            p25_latency: 10.0,
            p50_latency: 12.0,
            p95_latency: 20.0,
            p99_latency: 22.0,
            max_latency: 25.0,
            min_latency: 8.0,
            total_sent: 100,
            total_received: 900,
            status_codes: HashMap::from([(200, 9), (500, 1)]),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            status: "running".to_string(),
            agent_id: "aid_x".to_string(),
            errors: vec![],
        }
    }

    #[test]
    fn test_exposition_contains_metrics() {
        let body = encode_exposition(&snapshot()).unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.contains("loadswarm_total_requests 10"));
        assert!(text.contains("loadswarm_qps 6.7"));
        assert!(text.contains("loadswarm_status_codes_total{status_code=\"500\"} 1"));
    }

    #[tokio::test]
    async fn test_json_push_posts_snapshot() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sink"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = PushSink::new(
            reqwest::Client::new(),
            format!("{}/sink", server.uri()),
            "",
        );
        sink.push(&snapshot()).await;
    }

    #[tokio::test]
    async fn test_prometheus_push_targets_job_path() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/metrics/job/swarm/instance/aid_x"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = PushSink::new(reqwest::Client::new(), server.uri(), "swarm");
        sink.push(&snapshot()).await;
    }

    #[tokio::test]
    async fn test_push_failure_does_not_panic() {
        // Nothing listening on this port.
        let sink = PushSink::new(
            reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(200))
                .connect_timeout(std::time::Duration::from_millis(200))
                .build()
                .unwrap(),
            "http://127.0.0.1:1/sink",
            "",
        );
        sink.push(&snapshot()).await;
    }
}
