//! YAML configuration for the agent and collector processes.
//!
//! Configuration files are version-controlled test plans; every recognized
//! key has a default except the target URL and method (and the collector /
//! callback hosts when cluster mode is on). Loaded configurations are
//! plain-data and `PartialEq`, so a hot-reload can be compared deeply with
//! the running one and skipped when identical.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::client::Protocol;
use crate::utils::parse_duration_string;

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Duration format for YAML (e.g. 30 or "30s", "500ms").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigDuration {
    Seconds(u64),
    String(String),
}

impl ConfigDuration {
    pub fn to_std_duration(&self) -> Result<StdDuration, ConfigError> {
        match self {
            ConfigDuration::Seconds(s) => Ok(StdDuration::from_secs(*s)),
            ConfigDuration::String(s) => parse_duration_string(s)
                .map_err(|e| ConfigError::Validation(format!("Invalid duration '{}': {}", s, e))),
        }
    }
}

/// Agent process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Transport protocol: http, http2 or http3.
    #[serde(default)]
    pub protocol: Protocol,

    /// Target URL for the load test.
    #[serde(rename = "testURL")]
    pub test_url: String,

    /// HTTP method (GET, POST, PUT, PATCH, DELETE).
    pub method: String,

    /// Request body string.
    #[serde(default)]
    pub body: String,

    /// Headers as "Key: Value" lines.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Concurrent workers. Defaults to 3 × CPU.
    #[serde(default)]
    pub worker: Option<usize>,

    /// Total requests in fixed-count mode. Defaults to 5000 when no
    /// duration is set.
    #[serde(default)]
    pub total: Option<u64>,

    /// Wall-clock duration in fixed-duration mode (e.g. "10s").
    #[serde(default)]
    pub duration: Option<ConfigDuration>,

    /// Telemetry sink URL used in standalone mode.
    #[serde(rename = "pushURL", default)]
    pub push_url: String,

    /// Cadence of running-snapshot pushes.
    #[serde(rename = "agentPushInterval", default = "default_push_interval")]
    pub agent_push_interval: ConfigDuration,

    /// When set, pushURL is treated as a Prometheus push gateway.
    #[serde(rename = "prometheusJobName", default)]
    pub prometheus_job_name: String,

    /// Participate in collector-coordinated sessions.
    #[serde(rename = "clusterEnabled", default = "default_true")]
    pub cluster_enabled: bool,

    /// Collector base URL (required when clusterEnabled).
    #[serde(rename = "collectorHost", default)]
    pub collector_host: String,

    /// This agent's callback base URL (required when clusterEnabled).
    #[serde(rename = "agentHost", default)]
    pub agent_host: String,

    /// Unique agent id. A random "aid_" id is generated when unset.
    #[serde(rename = "agentID", default)]
    pub agent_id: Option<String>,

    /// Accept further sessions after each test.
    #[serde(rename = "loopTestSession", default = "default_true")]
    pub loop_test_session: bool,
}

fn default_true() -> bool {
    true
}

fn default_push_interval() -> ConfigDuration {
    ConfigDuration::String("1s".to_string())
}

/// 3 × CPU, the default worker count.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 3
}

impl AgentConfig {
    /// Loads and validates an agent configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parses and validates an agent configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field combinations. Termination policy and push settings
    /// are re-checked by the engine; this catches config mistakes at
    /// startup with descriptive messages.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_url.is_empty() {
            return Err(ConfigError::MissingField("testURL".to_string()));
        }
        if self.method.is_empty() {
            return Err(ConfigError::MissingField("method".to_string()));
        }

        if let Some(w) = self.worker {
            if w == 0 {
                return Err(ConfigError::Validation(
                    "worker must be at least 1".to_string(),
                ));
            }
        }

        if self.total.is_some() && self.resolved_duration()? > StdDuration::ZERO {
            return Err(ConfigError::Validation(
                "set either total or duration, not both".to_string(),
            ));
        }
        if self.total == Some(0) && self.duration.is_none() {
            return Err(ConfigError::Validation(
                "total must be greater than 0".to_string(),
            ));
        }

        let push_interval = self.agent_push_interval.to_std_duration()?;
        if push_interval < StdDuration::from_millis(100) || push_interval > StdDuration::from_secs(10)
        {
            return Err(ConfigError::Validation(format!(
                "agentPushInterval must be within [100ms, 10s], got {:?}",
                push_interval
            )));
        }

        if !self.prometheus_job_name.is_empty() && self.push_url.is_empty() {
            return Err(ConfigError::Validation(
                "prometheusJobName requires pushURL".to_string(),
            ));
        }

        if self.cluster_enabled {
            if self.collector_host.is_empty() {
                return Err(ConfigError::MissingField("collectorHost".to_string()));
            }
            if self.agent_host.is_empty() {
                return Err(ConfigError::MissingField("agentHost".to_string()));
            }
            for (key, value) in [
                ("collectorHost", &self.collector_host),
                ("agentHost", &self.agent_host),
            ] {
                reqwest::Url::parse(value).map_err(|e| {
                    ConfigError::Validation(format!("{} is not a valid URL: {}", key, e))
                })?;
            }
        }

        Ok(())
    }

    /// Worker count with the 3 × CPU default applied.
    pub fn resolved_worker(&self) -> usize {
        self.worker.unwrap_or_else(default_worker_count)
    }

    /// Total request count; 5000 unless a duration is set.
    pub fn resolved_total(&self) -> Result<u64, ConfigError> {
        if self.resolved_duration()? > StdDuration::ZERO {
            Ok(self.total.unwrap_or(0))
        } else {
            Ok(self.total.unwrap_or(5000))
        }
    }

    /// Fixed-run duration; zero selects fixed-count mode.
    pub fn resolved_duration(&self) -> Result<StdDuration, ConfigError> {
        match &self.duration {
            Some(d) => d.to_std_duration(),
            None => Ok(StdDuration::ZERO),
        }
    }

    pub fn resolved_push_interval(&self) -> Result<StdDuration, ConfigError> {
        self.agent_push_interval.to_std_duration()
    }
}

/// Collector process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Listen address, e.g. "0.0.0.0:8080".
    #[serde(rename = "listenAddr", default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl CollectorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CollectorConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "listenAddr '{}' is not host:port: {}",
                    self.listen_addr, e
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
testURL: "http://localhost:8080/ping"
method: "GET"
clusterEnabled: false
"#
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = AgentConfig::from_yaml(minimal_yaml()).unwrap();

        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.resolved_total().unwrap(), 5000);
        assert_eq!(config.resolved_duration().unwrap(), StdDuration::ZERO);
        assert_eq!(config.resolved_worker(), default_worker_count());
        assert_eq!(
            config.resolved_push_interval().unwrap(),
            StdDuration::from_secs(1)
        );
        assert!(config.loop_test_session);
        assert!(config.agent_id.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
protocol: http2
testURL: "https://api.example.com/orders"
method: "POST"
body: '{"qty": 1}'
headers:
  - "Content-Type: application/json"
  - "X-Trace: on"
worker: 8
duration: "30s"
pushURL: "http://push.example.com/sink"
agentPushInterval: "500ms"
clusterEnabled: true
collectorHost: "http://collector:8080"
agentHost: "http://10.0.0.5:8081"
agentID: "aid_fixedvalue"
loopTestSession: false
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.protocol, Protocol::Http2);
        assert_eq!(config.resolved_duration().unwrap(), StdDuration::from_secs(30));
        assert_eq!(config.resolved_total().unwrap(), 0);
        assert_eq!(config.resolved_worker(), 8);
        assert_eq!(config.agent_id.as_deref(), Some("aid_fixedvalue"));
        assert!(!config.loop_test_session);
    }

    #[test]
    fn test_missing_target_rejected() {
        let yaml = r#"
method: "GET"
clusterEnabled: false
"#;
        // Serde requires testURL, so this fails at parse time already.
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_total_and_duration_conflict() {
        let yaml = r#"
testURL: "http://localhost/x"
method: "GET"
total: 100
duration: "5s"
clusterEnabled: false
"#;
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_zero_worker_rejected() {
        let yaml = r#"
testURL: "http://localhost/x"
method: "GET"
worker: 0
clusterEnabled: false
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_push_interval_bounds() {
        let yaml = r#"
testURL: "http://localhost/x"
method: "GET"
agentPushInterval: "50ms"
clusterEnabled: false
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());

        let yaml = r#"
testURL: "http://localhost/x"
method: "GET"
agentPushInterval: "11s"
clusterEnabled: false
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_prometheus_job_requires_push_url() {
        let yaml = r#"
testURL: "http://localhost/x"
method: "GET"
prometheusJobName: "loadswarm"
clusterEnabled: false
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_cluster_mode_requires_hosts() {
        let yaml = r#"
testURL: "http://localhost/x"
method: "GET"
collectorHost: "http://collector:8080"
"#;
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "agentHost"));
    }

    #[test]
    fn test_deep_compare_detects_identical_reload() {
        let a = AgentConfig::from_yaml(minimal_yaml()).unwrap();
        let b = AgentConfig::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(a, b);

        let mut c = b.clone();
        c.worker = Some(2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_collector_config_defaults_and_validation() {
        let config = CollectorConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert!(config.validate().is_ok());

        let bad = CollectorConfig {
            listen_addr: "nowhere".to_string(),
        };
        assert!(bad.validate().is_err());
    }
}
