//! The server↔agent channel.
//!
//! Mutual TLS over TCP with length-prefixed JSON frames. The server dials
//! an agent with its own certificate; the agent presents the certificate
//! issued to it during registration; both sides validate against the
//! fleet CA. One request/response exchange per call.

pub mod frame;
pub mod material;
pub mod rpc;
pub mod tls;

use heron_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("frame of {0} bytes exceeds the payload cap")]
    FrameTooLarge(usize),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },
}

impl TransportError {
    /// The wire error code this failure maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Io(_) | TransportError::Timeout(_) => ErrorCode::Unreachable,
            TransportError::Tls(_) | TransportError::Certificate(_) => ErrorCode::Unauthorized,
            TransportError::FrameTooLarge(_) | TransportError::Decode(_) => {
                ErrorCode::InvalidInput
            }
            TransportError::Remote { code, .. } => *code,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
