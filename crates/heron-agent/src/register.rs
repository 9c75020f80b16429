//! Agent enrollment.
//!
//! On first boot the agent generates a persistent server token and an
//! ECDSA key with a CSR, then submits both to the server's registration
//! endpoint. The server records the token fingerprint and returns the
//! signed agent certificate plus the fleet CA certificate. The material
//! persists under the state directory; re-registering with the same token
//! re-issues the certificate idempotently.

use base64::Engine;
use rand::RngCore;

use heron_transport::material::generate_key_and_csr;
use heron_transport::rpc::{RegistrationRequest, RegistrationResponse};
use heron_transport::tls::TlsIdentity;

use crate::dirs;

/// Length of the generated server token before encoding.
const TOKEN_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("certificate material error: {0}")]
    Material(#[from] heron_transport::TransportError),
    #[error("registration request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server rejected the registration: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// The persistent server token, generated once and reused for every
/// registration. There is no rotation; replacing the token file forces a
/// new machine identity.
pub fn ensure_token() -> Result<String, RegisterError> {
    dirs::ensure_state_dir()?;
    let path = dirs::token_path();
    if path.exists() {
        let token = std::fs::read_to_string(&path)?;
        return Ok(token.trim().to_string());
    }

    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = base64::engine::general_purpose::STANDARD.encode(bytes);
    std::fs::write(&path, &token)?;
    tracing::info!("Generated a new server token");
    Ok(token)
}

/// Register this agent with the server and persist the issued material.
pub async fn register(
    server_url: &str,
    address: &str,
    agent_port: u16,
) -> Result<RegistrationResponse, RegisterError> {
    let token = ensure_token()?;

    let mut sans = vec![address.to_string()];
    if let Ok(host) = hostname::get() {
        let host = host.to_string_lossy().to_string();
        if host != address {
            sans.push(host);
        }
    }
    let (key_pem, csr_pem) = generate_key_and_csr(&format!("heron-agent-{address}"), &sans)?;

    let request = RegistrationRequest {
        address: address.to_string(),
        agent_port,
        token,
        csr_pem,
    };

    let url = format!("{}/api/machines", server_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        // Registration happens before the agent holds the fleet CA, so
        // the server certificate cannot be verified yet. The returned
        // server certificate fingerprint lets the operator cross-check.
        .danger_accept_invalid_certs(true)
        .build()?;
    let response = client.post(&url).json(&request).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RegisterError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    let registration: RegistrationResponse = response.json().await?;

    std::fs::write(dirs::key_path(), &key_pem)?;
    std::fs::write(dirs::cert_path(), &registration.cert_pem)?;
    std::fs::write(dirs::ca_cert_path(), &registration.ca_cert_pem)?;

    tracing::info!(
        machine_id = registration.machine_id,
        authorized = registration.authorized,
        server_cert_fingerprint = %registration.server_cert_fingerprint,
        "Registered with the server",
    );
    Ok(registration)
}

/// The agent's TLS identity from the state directory, if registration has
/// completed.
pub fn load_identity() -> Option<TlsIdentity> {
    let ca_cert_pem = std::fs::read_to_string(dirs::ca_cert_path()).ok()?;
    let cert_pem = std::fs::read_to_string(dirs::cert_path()).ok()?;
    let key_pem = std::fs::read_to_string(dirs::key_path()).ok()?;
    Some(TlsIdentity {
        ca_cert_pem,
        cert_pem,
        key_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Serialize state-dir env manipulation across tests.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_temp_state_dir<T>(f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HERON_AGENT_STATE_DIR", dir.path());
        let result = f();
        std::env::remove_var("HERON_AGENT_STATE_DIR");
        result
    }

    #[test]
    fn token_is_generated_once_and_persisted() {
        with_temp_state_dir(|| {
            let first = ensure_token().unwrap();
            let second = ensure_token().unwrap();
            assert_eq!(first, second);
            assert!(!first.is_empty());
        });
    }

    #[test]
    fn identity_is_none_before_registration() {
        with_temp_state_dir(|| {
            assert!(load_identity().is_none());
        });
    }

    #[test]
    fn identity_loads_after_material_is_written() {
        with_temp_state_dir(|| {
            let ca = heron_transport::material::generate_ca().unwrap();
            let cert =
                heron_transport::material::issue_cert(&ca, "agent", &["127.0.0.1".into()])
                    .unwrap();
            dirs::ensure_state_dir().unwrap();
            std::fs::write(dirs::ca_cert_path(), &ca.cert_pem).unwrap();
            std::fs::write(dirs::cert_path(), &cert.cert_pem).unwrap();
            std::fs::write(dirs::key_path(), &cert.key_pem).unwrap();

            let identity = load_identity().unwrap();
            assert_eq!(identity.cert_pem, cert.cert_pem);
        });
    }
}
