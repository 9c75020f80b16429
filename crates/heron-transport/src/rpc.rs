//! The RPC surface between server and agent.
//!
//! Requests and responses are serde JSON structures carried in frames
//! (`crate::frame`). The surface is fixed: `ping`, `get-state`,
//! `forward-to-kea`, `forward-to-named-stats`, `tail-text-file`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;

use heron_common::error::ErrorCode;

use crate::frame::{read_frame, write_frame};
use crate::tls::{connector, server_name, TlsIdentity};
use crate::{Result, TransportError};

/// Default per-call timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    Ping,
    GetState,
    /// Relay JSON command payloads to the Kea Control Agent at `url`.
    ForwardToKea { url: String, payloads: Vec<Value> },
    /// Relay a GET to the named statistics channel at `url`.
    ForwardToNamedStats { url: String },
    /// Return up to `max_lines` lines of `path` ending at `offset`
    /// (`None` = end of file).
    TailTextFile {
        path: String,
        offset: Option<u64>,
        max_lines: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum Response {
    Pong,
    State(StateReport),
    Kea { responses: Vec<Value> },
    NamedStats { response: Value },
    Tail { lines: Vec<String>, offset: u64 },
    Error(WireError),
}

/// Application variant tags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Kea,
    Bind9,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Kea => "kea",
            AppType::Bind9 => "bind9",
        }
    }
}

/// Access point kinds a daemon exposes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessPointKind {
    Control,
    Statistics,
}

impl AccessPointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPointKind::Control => "control",
            AccessPointKind::Statistics => "statistics",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessPointReport {
    pub kind: AccessPointKind,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub use_secure_protocol: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppReport {
    pub app_type: AppType,
    pub access_points: Vec<AccessPointReport>,
}

/// The agent's view of its host, returned by `get-state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateReport {
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub apps: Vec<AppReport>,
}

// ── Registration (REST, not framed RPC) ─────────────────────────────

/// Body of the agent's `POST /api/machines` enrollment request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationRequest {
    pub address: String,
    pub agent_port: u16,
    /// The agent's persistent server token, base64.
    pub token: String,
    pub csr_pem: String,
}

/// Server answer to a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationResponse {
    pub machine_id: i64,
    pub authorized: bool,
    pub cert_pem: String,
    pub ca_cert_pem: String,
    pub server_cert_fingerprint: String,
}

// ── Client ──────────────────────────────────────────────────────────

/// One-exchange-per-connection RPC client used by the server to call
/// agents.
pub struct RpcClient {
    identity: TlsIdentity,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(identity: TlsIdentity) -> Self {
        RpcClient {
            identity,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dial `host:port`, perform the TLS handshake, send one request, and
    /// read one response. A `Response::Error` from the peer becomes
    /// `TransportError::Remote`.
    pub async fn call(&self, host: &str, port: u16, request: &Request) -> Result<Response> {
        let exchange = async {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            let connector = connector(&self.identity)?;
            let mut tls = connector
                .connect(server_name(host)?, stream)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;

            let payload = serde_json::to_vec(request)
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            write_frame(&mut tls, &payload).await?;
            let reply = read_frame(&mut tls).await?;
            serde_json::from_slice::<Response>(&reply)
                .map_err(|e| TransportError::Decode(e.to_string()))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        match response {
            Response::Error(err) => Err(TransportError::Remote {
                code: err.code,
                message: err.message,
            }),
            other => Ok(other),
        }
    }
}
