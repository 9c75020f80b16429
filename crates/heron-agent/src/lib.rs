//! The Heron agent library.
//!
//! The binary in `main.rs` wires these pieces: local app detection
//! (`monitor`), the credentials store for Kea Basic-Auth (`credentials`),
//! command forwarding (`forward`), the mTLS RPC service (`rpc`),
//! registration against the server (`register`), and the Prometheus
//! re-export endpoint (`exporter`).

pub mod credentials;
pub mod dirs;
pub mod exporter;
pub mod forward;
pub mod monitor;
pub mod register;
pub mod rpc;
