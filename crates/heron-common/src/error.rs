use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by the REST API, the agent RPC channel, and the event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed IP, prefix, or JSON supplied by the caller. Never retried.
    InvalidInput,
    /// Absent entity on read or update-by-id.
    NotFound,
    /// Unique-constraint violation, e.g. two machines claiming one address.
    Conflict,
    /// Network-level failure talking to an agent or a Kea Control Agent.
    Unreachable,
    /// Bad or expired token or certificate. Not retried.
    Unauthorized,
    /// Unexpected invariant violation. The offending task is aborted.
    Internal,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Internal => 500,
            Self::Unreachable => 502,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unreachable => "unreachable",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}
