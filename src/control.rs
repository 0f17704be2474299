//! Agent control listener.
//!
//! Exposes `/ready`, `/start`, `/stop`, `/cancel` and `/ping` for the
//! collector. Every endpoint requires `test_id` and `agent_id` query
//! parameters matching the agent's current session: a mismatch answers
//! 400, a state precondition failure answers 409.

use std::collections::HashMap;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentHandle, ControlSignal};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid agent host URL '{0}'")]
    InvalidHost(String),

    #[error("Failed to bind control listener: {0}")]
    Bind(#[from] hyper::Error),
}

/// A running control listener. Dropping the token passed at start shuts
/// it down gracefully.
pub struct ControlServer {
    pub addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Binds the control listener on the port negotiated from the agent-host
/// URL. When that port cannot be bound, the scheme default (80/443) is
/// tried instead with a warning.
pub fn start_control_listener(
    handle: AgentHandle,
    agent_host: &str,
    cancel: CancellationToken,
) -> Result<ControlServer, ControlError> {
    let url = reqwest::Url::parse(agent_host)
        .map_err(|_| ControlError::InvalidHost(agent_host.to_string()))?;
    let scheme_default: u16 = if url.scheme() == "https" { 443 } else { 80 };
    let port = url.port().unwrap_or(scheme_default);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match start_control_server(handle.clone(), addr, cancel.clone()) {
        Ok(server) => Ok(server),
        Err(e) => {
            warn!(
                port,
                fallback = scheme_default,
                error = %e,
                "Control port unavailable, falling back to scheme default"
            );
            start_control_server(handle, SocketAddr::from(([0, 0, 0, 0], scheme_default)), cancel)
        }
    }
}

/// Binds the control listener on an explicit address (port 0 picks an
/// ephemeral one).
pub fn start_control_server(
    handle: AgentHandle,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<ControlServer, ControlError> {
    let make_svc = make_service_fn(move |_conn| {
        let handle = handle.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let handle = handle.clone();
                async move { control_handler(req, handle).await }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    let graceful = server.with_graceful_shutdown(async move { cancel.cancelled().await });

    info!(addr = %local_addr, "Agent control listener started");

    let task = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            error!(error = %e, "Control listener error");
        }
    });

    Ok(ControlServer {
        addr: local_addr,
        task,
    })
}

async fn control_handler(
    req: Request<Body>,
    handle: AgentHandle,
) -> Result<Response<Body>, hyper::Error> {
    if req.method() != Method::POST {
        return Ok(plain_response(StatusCode::NOT_FOUND, "not found"));
    }

    let signal = match req.uri().path() {
        "/ready" => ControlSignal::Ready,
        "/start" => ControlSignal::Start,
        "/stop" => ControlSignal::Stop,
        "/cancel" => ControlSignal::Cancel,
        "/ping" => ControlSignal::Ping,
        _ => return Ok(plain_response(StatusCode::NOT_FOUND, "not found")),
    };

    let query = parse_query(req.uri().query().unwrap_or(""));
    let test_id = query.get("test_id").map(String::as_str).unwrap_or("");
    let agent_id = query.get("agent_id").map(String::as_str).unwrap_or("");

    if agent_id != handle.agent_id()
        || handle.current_test_id().as_deref() != Some(test_id)
    {
        warn!(
            signal = signal.as_str(),
            test_id,
            agent_id,
            "Control request for a different session"
        );
        return Ok(plain_response(
            StatusCode::BAD_REQUEST,
            "test_id or agent_id does not match the current session",
        ));
    }

    match handle.apply_signal(signal) {
        Ok(()) => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
        Err(state) => {
            warn!(
                signal = signal.as_str(),
                state = state.as_str(),
                "Control signal refused by state machine"
            );
            Ok(plain_response(
                StatusCode::CONFLICT,
                &format!("/{} is not valid in state {}", signal.as_str(), state.as_str()),
            ))
        }
    }
}

/// Minimal query-string parser; control ids are plain alphanumerics, so
/// no percent-decoding is required.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

fn json_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}
