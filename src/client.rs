//! HTTP client construction and request parameters.
//!
//! All workers of one engine run share a single tuned `reqwest` client.
//! The three supported protocol tags differ only in transport
//! configuration; everything downstream treats them uniformly.

use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::utils::parse_header_line;

/// Errors raised while building request parameters or the shared client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported HTTP method '{0}'. Use GET, POST, PUT, PATCH or DELETE.")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("HTTP/3 requires a QUIC-enabled build (feature `http3`)")]
    Http3Unavailable,

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Transport protocol tag for the load-generating client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Http2,
    Http3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Http3 => "http3",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "http2" => Ok(Protocol::Http2),
            "http3" => Ok(Protocol::Http3),
            _ => Err(format!(
                "Invalid protocol: '{}'. Use 'http', 'http2', or 'http3'.",
                s
            )),
        }
    }
}

/// Immutable per-test request description.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub protocol: Protocol,
}

impl RequestParams {
    /// Builds validated request parameters.
    ///
    /// The URL must parse, the method must be one of
    /// GET/POST/PUT/PATCH/DELETE (case-insensitive input), and every
    /// header line must be `Key: Value`.
    pub fn new(
        url: &str,
        method: &str,
        header_lines: &[String],
        body: Vec<u8>,
        protocol: Protocol,
    ) -> Result<Self, ClientError> {
        reqwest::Url::parse(url).map_err(|e| ClientError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let method = match method.to_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            other => return Err(ClientError::InvalidMethod(other.to_string())),
        };

        let mut headers = HeaderMap::new();
        for line in header_lines {
            let (name, value) = parse_header_line(line).map_err(ClientError::InvalidHeader)?;
            let name = HeaderName::from_str(&name)
                .map_err(|e| ClientError::InvalidHeader(format!("{}: {}", name, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ClientError::InvalidHeader(format!("{}: {}", name, e)))?;
            headers.insert(name, value);
        }

        Ok(Self {
            url: url.to_string(),
            method,
            headers,
            body,
            protocol,
        })
    }

    /// Whether the request carries the configured body.
    pub fn sends_body(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

/// Builds the shared HTTP client for one engine run.
///
/// Transport tuning follows testing-tool semantics: the connection pool is
/// sized to the worker count, certificates are not verified, and a single
/// request may take at most 15 seconds.
pub fn build_client(protocol: Protocol, workers: usize) -> Result<reqwest::Client, ClientError> {
    let builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(workers)
        .pool_idle_timeout(Duration::from_secs(90))
        .danger_accept_invalid_certs(true);

    let builder = match protocol {
        Protocol::Http => builder,
        Protocol::Http2 => builder.http2_prior_knowledge(),
        Protocol::Http3 => {
            #[cfg(feature = "http3")]
            {
                builder.http3_prior_knowledge()
            }
            #[cfg(not(feature = "http3"))]
            {
                warn!("protocol http3 requested but this build has no QUIC support");
                return Err(ClientError::Http3Unavailable);
            }
        }
    };

    Ok(builder.build()?)
}

/// Builds the small client used for control-plane calls (register, ping,
/// ready/start/stop/cancel, report push). Short timeout, plain HTTP/1.1.
pub fn build_control_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
