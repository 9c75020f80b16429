//! Server-side client for the agent RPC channel.
//!
//! Wraps `heron_transport::rpc::RpcClient` with per-target error counters
//! so the UI can show how often an agent has been unreachable. Network
//! failures increment the counter of the target; authentication failures
//! are surfaced distinctly and do not count as unreachability.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use heron_transport::rpc::{Request, Response, RpcClient, StateReport};
use heron_transport::tls::TlsIdentity;
use heron_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum AgentCommError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected reply from agent: {0}")]
    UnexpectedReply(&'static str),
}

impl AgentCommError {
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            AgentCommError::Transport(
                TransportError::Io(_) | TransportError::Timeout(_)
            )
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AgentCommError::Transport(
                TransportError::Tls(_) | TransportError::Certificate(_)
            )
        ) || matches!(
            self,
            AgentCommError::Transport(TransportError::Remote { code, .. })
                if *code == heron_common::error::ErrorCode::Unauthorized
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentCommError>;

/// Shared client for all agents, keyed calls by `(address, port)`.
pub struct AgentClients {
    client: RpcClient,
    error_counts: Mutex<HashMap<(String, u16), u64>>,
}

impl AgentClients {
    pub fn new(identity: TlsIdentity, timeout: Duration) -> Self {
        AgentClients {
            client: RpcClient::new(identity).with_timeout(timeout),
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Consecutive unreachable-call count for a target.
    pub fn error_count(&self, address: &str, port: u16) -> u64 {
        let counts = self.error_counts.lock().unwrap();
        counts
            .get(&(address.to_string(), port))
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, address: &str, port: u16, error: Option<&AgentCommError>) {
        let mut counts = self.error_counts.lock().unwrap();
        let entry = counts.entry((address.to_string(), port)).or_insert(0);
        match error {
            Some(e) if e.is_unreachable() => *entry += 1,
            Some(_) => {}
            None => *entry = 0,
        }
    }

    async fn call(&self, address: &str, port: u16, request: Request) -> Result<Response> {
        let result = self
            .client
            .call(address, port, &request)
            .await
            .map_err(AgentCommError::from);
        self.record(address, port, result.as_ref().err());
        result
    }

    pub async fn ping(&self, address: &str, port: u16) -> Result<()> {
        match self.call(address, port, Request::Ping).await? {
            Response::Pong => Ok(()),
            _ => Err(AgentCommError::UnexpectedReply("expected pong")),
        }
    }

    pub async fn get_state(&self, address: &str, port: u16) -> Result<StateReport> {
        match self.call(address, port, Request::GetState).await? {
            Response::State(state) => Ok(state),
            _ => Err(AgentCommError::UnexpectedReply("expected state")),
        }
    }

    pub async fn forward_to_kea(
        &self,
        address: &str,
        port: u16,
        url: &str,
        payloads: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let request = Request::ForwardToKea {
            url: url.to_string(),
            payloads,
        };
        match self.call(address, port, request).await? {
            Response::Kea { responses } => Ok(responses),
            _ => Err(AgentCommError::UnexpectedReply("expected kea responses")),
        }
    }

    pub async fn forward_to_named_stats(
        &self,
        address: &str,
        port: u16,
        url: &str,
    ) -> Result<Value> {
        let request = Request::ForwardToNamedStats {
            url: url.to_string(),
        };
        match self.call(address, port, request).await? {
            Response::NamedStats { response } => Ok(response),
            _ => Err(AgentCommError::UnexpectedReply("expected named stats")),
        }
    }

    pub async fn tail_text_file(
        &self,
        address: &str,
        port: u16,
        path: &str,
        offset: Option<u64>,
        max_lines: usize,
    ) -> Result<(Vec<String>, u64)> {
        let request = Request::TailTextFile {
            path: path.to_string(),
            offset,
            max_lines,
        };
        match self.call(address, port, request).await? {
            Response::Tail { lines, offset } => Ok((lines, offset)),
            _ => Err(AgentCommError::UnexpectedReply("expected tail")),
        }
    }
}
