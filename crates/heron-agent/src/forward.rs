//! Stateless command forwarding to local daemons.
//!
//! The agent relays JSON command payloads to the Kea Control Agent and
//! plain GETs to the named statistics channel. Retries and backoff are the
//! caller's responsibility; this layer only classifies failures so the
//! server can count unreachable targets separately from auth problems.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use heron_common::error::ErrorCode;
use heron_transport::rpc::WireError;

use crate::credentials::CredentialsStore;

/// Timeout for one relayed exchange with a local daemon.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for relayed exchanges. `skip_tls_verify` disables certificate
/// verification for Kea deployments running HTTPS with a site-local CA.
pub fn http_client(skip_tls_verify: bool) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(FORWARD_TIMEOUT)
        .danger_accept_invalid_certs(skip_tls_verify)
        .build()
        .unwrap_or_default()
}

fn unreachable(url: &str, e: impl std::fmt::Display) -> WireError {
    WireError {
        code: ErrorCode::Unreachable,
        message: format!("cannot reach {url}: {e}"),
    }
}

/// Relay `payloads` to the Kea Control Agent at `url`, one POST each,
/// attaching Basic-Auth credentials when the target has a record.
pub async fn forward_to_kea(
    client: &reqwest::Client,
    credentials: &Arc<CredentialsStore>,
    url: &str,
    payloads: &[Value],
) -> Result<Vec<Value>, WireError> {
    let auth = credentials.get_basic_auth_by_url(url);
    let mut responses = Vec::with_capacity(payloads.len());

    for payload in payloads {
        let mut request = client.post(url).json(payload);
        if let Some(ref auth) = auth {
            request = request.basic_auth(&auth.user, Some(&auth.password));
        }

        let response = request.send().await.map_err(|e| unreachable(url, e))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(WireError {
                code: ErrorCode::Unauthorized,
                message: format!("Kea Control Agent at {url} rejected the credentials"),
            });
        }
        if !status.is_success() {
            return Err(unreachable(url, format!("HTTP {status}")));
        }

        let body: Value = response.json().await.map_err(|e| WireError {
            code: ErrorCode::InvalidInput,
            message: format!("Kea Control Agent at {url} returned malformed JSON: {e}"),
        })?;
        responses.push(body);
    }

    Ok(responses)
}

/// Relay a GET to the named statistics channel at `url`.
pub async fn forward_to_named_stats(
    client: &reqwest::Client,
    url: &str,
) -> Result<Value, WireError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| unreachable(url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(unreachable(url, format!("HTTP {status}")));
    }
    response.json().await.map_err(|e| WireError {
        code: ErrorCode::InvalidInput,
        message: format!("named statistics channel at {url} returned malformed JSON: {e}"),
    })
}
