//! Certificate material: fleet CA, server identity, and agent issuance.
//!
//! ECDSA P-256 throughout. The CA signs the server certificate at first
//! boot and every agent CSR at registration. All material travels as PEM.

use chrono::{Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};

use crate::{Result, TransportError};

/// Validity of the fleet root certificate.
const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Validity of server and agent certificates.
const CERT_VALIDITY_DAYS: i64 = 2 * 365;

/// A PEM key/certificate pair.
#[derive(Debug, Clone)]
pub struct PemPair {
    pub key_pem: String,
    pub cert_pem: String,
}

fn certificate_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Certificate(e.to_string())
}

fn validity_window(params: &mut CertificateParams, days: i64) {
    let not_before = Utc::now();
    let not_after = not_before + Duration::days(days);
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());
}

/// Generate the self-signed fleet root CA.
pub fn generate_ca() -> Result<PemPair> {
    let key = KeyPair::generate().map_err(certificate_error)?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "Heron Fleet CA");
    params.distinguished_name.push(DnType::OrganizationName, "Heron");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    validity_window(&mut params, CA_VALIDITY_DAYS);

    let cert = params.self_signed(&key).map_err(certificate_error)?;
    Ok(PemPair {
        key_pem: key.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Rebuild the issuer pair rcgen needs for `signed_by` from CA PEM.
fn load_issuer(ca: &PemPair) -> Result<(rcgen::Certificate, KeyPair)> {
    let key = KeyPair::from_pem(&ca.key_pem).map_err(certificate_error)?;
    let params =
        CertificateParams::from_ca_cert_pem(&ca.cert_pem).map_err(certificate_error)?;
    let cert = params.self_signed(&key).map_err(certificate_error)?;
    Ok((cert, key))
}

/// Issue a certificate for a subject, signed by the fleet CA.
/// `sans` entries may be DNS names or IP literals.
pub fn issue_cert(ca: &PemPair, common_name: &str, sans: &[String]) -> Result<PemPair> {
    let (issuer_cert, issuer_key) = load_issuer(ca)?;
    let subject_key = KeyPair::generate().map_err(certificate_error)?;

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    push_sans(&mut params, sans)?;
    validity_window(&mut params, CERT_VALIDITY_DAYS);

    let cert = params
        .signed_by(&subject_key, &issuer_cert, &issuer_key)
        .map_err(certificate_error)?;
    Ok(PemPair {
        key_pem: subject_key.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Generate a fresh key and a CSR for it (the agent side of enrollment).
pub fn generate_key_and_csr(common_name: &str, sans: &[String]) -> Result<(String, String)> {
    let key = KeyPair::generate().map_err(certificate_error)?;
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    push_sans(&mut params, sans)?;
    let csr = params.serialize_request(&key).map_err(certificate_error)?;
    Ok((key.serialize_pem(), csr.pem().map_err(certificate_error)?))
}

/// Sign an agent CSR with the fleet CA (the server side of enrollment).
pub fn sign_csr(ca: &PemPair, csr_pem: &str) -> Result<String> {
    let (issuer_cert, issuer_key) = load_issuer(ca)?;
    let mut csr =
        CertificateSigningRequestParams::from_pem(csr_pem).map_err(certificate_error)?;
    csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    validity_window(&mut csr.params, CERT_VALIDITY_DAYS);
    let cert = csr
        .signed_by(&issuer_cert, &issuer_key)
        .map_err(certificate_error)?;
    Ok(cert.pem())
}

fn push_sans(params: &mut CertificateParams, sans: &[String]) -> Result<()> {
    for san in sans {
        if let Ok(ip) = san.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(san.clone().try_into().map_err(certificate_error)?));
        }
    }
    Ok(())
}

/// SHA-256 hex digest, used for token and certificate fingerprints.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 fingerprint of the first certificate in a PEM document,
/// computed over its DER encoding.
pub fn cert_fingerprint(cert_pem: &str) -> Result<String> {
    let mut cursor = std::io::Cursor::new(cert_pem.as_bytes());
    match rustls_pemfile::read_one(&mut cursor) {
        Ok(Some(rustls_pemfile::Item::X509Certificate(der))) => Ok(sha256_hex(der.as_ref())),
        _ => Err(TransportError::Certificate(
            "no certificate found in PEM".to_string(),
        )),
    }
}
