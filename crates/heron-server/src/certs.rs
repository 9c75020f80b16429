//! Server-side secret material.
//!
//! The five managed objects (`cakey`, `cacert`, `srvkey`, `srvcert`,
//! `srvtkn`) live in the store. The CA pair and the server identity are
//! generated lazily at first boot; `heron-tool cert-import`/`cert-export`
//! move them between deployments.

use base64::Engine;
use rand::RngCore;

use heron_transport::material::{self, PemPair};
use heron_transport::tls::TlsIdentity;

use crate::store::{secret, Db, Result, StoreError};

/// Length of the generated server token before encoding.
const SERVER_TOKEN_BYTES: usize = 32;

fn material_error(e: heron_transport::TransportError) -> StoreError {
    StoreError::Migration(format!("certificate material: {e}"))
}

/// Load or create all secret objects and return the server's mTLS
/// identity.
pub fn ensure_server_material(db: &Db, server_name: &str) -> Result<TlsIdentity> {
    let conn = db.connection();

    let ca = match (secret::get(&conn, "cakey")?, secret::get(&conn, "cacert")?) {
        (Some(key_pem), Some(cert_pem)) => PemPair { key_pem, cert_pem },
        _ => {
            let ca = material::generate_ca().map_err(material_error)?;
            secret::set(&conn, "cakey", &ca.key_pem)?;
            secret::set(&conn, "cacert", &ca.cert_pem)?;
            tracing::info!("Generated the fleet CA");
            ca
        }
    };

    let server = match (secret::get(&conn, "srvkey")?, secret::get(&conn, "srvcert")?) {
        (Some(key_pem), Some(cert_pem)) => PemPair { key_pem, cert_pem },
        _ => {
            let sans = vec![
                server_name.to_string(),
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ];
            let server = material::issue_cert(&ca, server_name, &sans).map_err(material_error)?;
            secret::set(&conn, "srvkey", &server.key_pem)?;
            secret::set(&conn, "srvcert", &server.cert_pem)?;
            tracing::info!("Issued the server certificate");
            server
        }
    };

    if secret::get(&conn, "srvtkn")?.is_none() {
        let mut bytes = [0u8; SERVER_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::STANDARD.encode(bytes);
        secret::set(&conn, "srvtkn", &token)?;
    }

    Ok(TlsIdentity {
        ca_cert_pem: ca.cert_pem,
        cert_pem: server.cert_pem,
        key_pem: server.key_pem,
    })
}

/// Sign an agent CSR with the stored CA. Returns the agent certificate,
/// the CA certificate, and the server certificate fingerprint the agent
/// shows the operator for cross-checking.
pub fn sign_agent_csr(db: &Db, csr_pem: &str) -> Result<(String, String, String)> {
    let conn = db.connection();
    let ca = match (secret::get(&conn, "cakey")?, secret::get(&conn, "cacert")?) {
        (Some(key_pem), Some(cert_pem)) => PemPair { key_pem, cert_pem },
        _ => return Err(StoreError::NotFound("fleet CA")),
    };
    let server_cert = secret::get(&conn, "srvcert")?.ok_or(StoreError::NotFound("srvcert"))?;

    let cert_pem = material::sign_csr(&ca, csr_pem)
        .map_err(|e| StoreError::Conflict(format!("cannot sign the CSR: {e}")))?;
    let fingerprint = material::cert_fingerprint(&server_cert).map_err(material_error)?;
    Ok((cert_pem, ca.cert_pem, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_is_generated_once() {
        let db = Db::open_in_memory().unwrap();
        let first = ensure_server_material(&db, "heron-server").unwrap();
        let second = ensure_server_material(&db, "heron-server").unwrap();
        assert_eq!(first.ca_cert_pem, second.ca_cert_pem);
        assert_eq!(first.cert_pem, second.cert_pem);

        let conn = db.connection();
        for name in secret::OBJECTS {
            assert!(secret::get(&conn, name).unwrap().is_some(), "object {name}");
        }
    }

    #[test]
    fn csr_signing_uses_the_stored_ca() {
        let db = Db::open_in_memory().unwrap();
        ensure_server_material(&db, "heron-server").unwrap();

        let (_, csr_pem) =
            material::generate_key_and_csr("agent-1", &["192.0.2.10".to_string()]).unwrap();
        let (cert_pem, ca_pem, fingerprint) = sign_agent_csr(&db, &csr_pem).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(fingerprint.len(), 64);
    }

    #[test]
    fn signing_without_ca_fails() {
        let db = Db::open_in_memory().unwrap();
        let (_, csr_pem) = material::generate_key_and_csr("agent", &[]).unwrap();
        assert!(sign_agent_csr(&db, &csr_pem).is_err());
    }
}
