//! rustls configuration from PEM material.
//!
//! Both directions of the channel require the peer certificate: the agent
//! verifies the server against the fleet CA, and the agent's listener
//! requires a client certificate chained to the same CA.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

use crate::{Result, TransportError};

pub use tokio_rustls::TlsAcceptor;
pub use tokio_rustls::TlsConnector;

/// PEM material for one side of the channel.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// The fleet CA certificate used to verify the peer.
    pub ca_cert_pem: String,
    /// This side's certificate.
    pub cert_pem: String,
    /// This side's private key.
    pub key_pem: String,
}

fn tls_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

pub fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    while let Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) =
        rustls_pemfile::read_one(&mut cursor)
    {
        certs.push(cert);
    }
    if certs.is_empty() {
        return Err(TransportError::Tls("no certificates found in PEM".into()));
    }
    Ok(certs)
}

pub fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => {}
        }
    }
    Err(TransportError::Tls("no private key found in PEM".into()))
}

fn root_store(ca_cert_pem: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_cert_pem)? {
        store.add(cert).map_err(tls_error)?;
    }
    Ok(store)
}

/// Connector presenting `identity` and trusting only the fleet CA.
pub fn connector(identity: &TlsIdentity) -> Result<TlsConnector> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store(&identity.ca_cert_pem)?)
        .with_client_auth_cert(
            load_certs(&identity.cert_pem)?,
            load_private_key(&identity.key_pem)?,
        )
        .map_err(tls_error)?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Acceptor presenting `identity` and requiring a client certificate
/// chained to the fleet CA.
pub fn acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(&identity.ca_cert_pem)?))
        .build()
        .map_err(tls_error)?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certs(&identity.cert_pem)?,
            load_private_key(&identity.key_pem)?,
        )
        .map_err(tls_error)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// rustls server name for an address that may be an IP literal.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(tls_error)
}
