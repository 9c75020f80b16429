//! The agent's mTLS RPC service.
//!
//! Accepts framed requests from the server over mutual TLS and dispatches
//! them against the local inventory. The connection stays open for
//! repeated exchanges; the server usually sends one request and drops it.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use heron_common::error::ErrorCode;
use heron_transport::frame::{read_frame, write_frame};
use heron_transport::rpc::{Request, Response, StateReport, WireError};
use heron_transport::tls::{acceptor, TlsIdentity};

use crate::credentials::CredentialsStore;
use crate::forward;
use crate::monitor::AppMonitor;

/// Everything a request dispatch needs.
pub struct RpcService {
    pub monitor: Arc<AppMonitor>,
    pub credentials: Arc<CredentialsStore>,
    pub client: reqwest::Client,
}

impl RpcService {
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::GetState => Response::State(self.state_report()),
            Request::ForwardToKea { url, payloads } => {
                match forward::forward_to_kea(&self.client, &self.credentials, &url, &payloads)
                    .await
                {
                    Ok(responses) => Response::Kea { responses },
                    Err(err) => Response::Error(err),
                }
            }
            Request::ForwardToNamedStats { url } => {
                match forward::forward_to_named_stats(&self.client, &url).await {
                    Ok(response) => Response::NamedStats { response },
                    Err(err) => Response::Error(err),
                }
            }
            Request::TailTextFile {
                path,
                offset,
                max_lines,
            } => tail_text_file(&path, offset, max_lines),
        }
    }

    pub fn state_report(&self) -> StateReport {
        StateReport {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string()),
            apps: self.monitor.apps(),
        }
    }
}

/// Serve the RPC endpoint until cancelled.
pub async fn serve(
    bind_address: &str,
    port: u16,
    identity: &TlsIdentity,
    service: Arc<RpcService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind_address, port)).await?;
    let tls = acceptor(identity)?;
    tracing::info!(port, "RPC service listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let tls = tls.clone();
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = match tls.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = read_frame(&mut stream) => frame,
                };
                let request = match request {
                    Ok(bytes) => bytes,
                    // EOF or broken pipe ends the session quietly.
                    Err(_) => break,
                };

                let response = match serde_json::from_slice::<Request>(&request) {
                    Ok(request) => service.dispatch(request).await,
                    Err(e) => Response::Error(WireError {
                        code: ErrorCode::InvalidInput,
                        message: format!("malformed request: {e}"),
                    }),
                };

                let payload = match serde_json::to_vec(&response) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "Response serialization failed");
                        break;
                    }
                };
                if write_frame(&mut stream, &payload).await.is_err() {
                    break;
                }
            }
        });
    }

    tracing::debug!("RPC service stopped");
    Ok(())
}

/// Return up to `max_lines` lines of `path` ending at byte `offset`
/// (`None` = end of file). The returned offset is the byte position the
/// tail ends at, so callers can page backwards.
fn tail_text_file(path: &str, offset: Option<u64>, max_lines: usize) -> Response {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                ErrorCode::NotFound
            } else {
                ErrorCode::Internal
            };
            return Response::Error(WireError {
                code,
                message: format!("cannot read {path}: {e}"),
            });
        }
    };

    let mut end = offset
        .map(|o| (o as usize).min(content.len()))
        .unwrap_or(content.len());
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    let window = &content[..end];
    let lines: Vec<String> = window
        .lines()
        .rev()
        .take(max_lines)
        .map(str::to_string)
        .collect();
    Response::Tail {
        lines: lines.into_iter().rev().collect(),
        offset: end as u64,
    }
}
