//! Canonical text forms for IP addresses and CIDR prefixes.
//!
//! Two inputs that denote the same address must produce byte-equal keys:
//! IPv4 is re-emitted in dotted-quad form, IPv6 is lowercased and
//! zero-collapsed to the shortest form (RFC 5952). Only literal addresses
//! are accepted; hostnames and malformed strings fail.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

/// Address family of a subnet prefix or IP literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family derivable from the textual form of a prefix or address.
    pub fn of(text: &str) -> Family {
        if text.contains(':') {
            Family::V6
        } else {
            Family::V4
        }
    }

    pub fn as_number(&self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("not a literal IP address: {0:?}")]
    InvalidAddress(String),
    #[error("not a CIDR prefix: {0:?}")]
    InvalidPrefix(String),
}

/// Parse a literal IPv4/IPv6 address and return its canonical string form.
pub fn canonicalize_ip(text: &str) -> Result<String, AddrError> {
    let addr = IpAddr::from_str(text.trim())
        .map_err(|_| AddrError::InvalidAddress(text.to_string()))?;
    Ok(addr.to_string())
}

/// Parse a CIDR prefix. Host bits are preserved so callers can tell a
/// non-canonical prefix from its canonical form.
pub fn parse_prefix(text: &str) -> Result<IpNet, AddrError> {
    IpNet::from_str(text.trim()).map_err(|_| AddrError::InvalidPrefix(text.to_string()))
}

/// The canonical form of a prefix: network address masked to the prefix
/// length, IPv6 zero-collapsed to the shortest form.
pub fn canonical_prefix(text: &str) -> Result<String, AddrError> {
    let net = parse_prefix(text)?;
    Ok(net.trunc().to_string())
}

/// A prefix is canonical iff it equals its canonical form.
pub fn is_canonical_prefix(text: &str) -> bool {
    matches!(canonical_prefix(text), Ok(canonical) if canonical == text)
}

/// A wildcard listening address is not a valid connect target; rewrite it
/// to the loopback of the same family.
pub fn wildcard_to_loopback(address: &str) -> String {
    match address {
        "0.0.0.0" => "127.0.0.1".to_string(),
        "::" => "::1".to_string(),
        other => other.to_string(),
    }
}
