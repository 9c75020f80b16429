//! The Heron server library.
//!
//! The binary in `main.rs` wires the pieces: the SQLite store and its
//! models (`store`), the reconciliation commit layer (`reconcile`), the
//! periodic puller scheduler (`puller`, `pullers`), the agent RPC client
//! (`agentcomm`), Kea command plumbing (`kea`), the utilization
//! calculator (`utilization`), the configuration review engine
//! (`review`), the event bus (`events`), Prometheus metrics (`metrics`),
//! certificate material management (`certs`), and the REST API (`http`).

pub mod agentcomm;
pub mod certs;
pub mod events;
pub mod http;
pub mod kea;
pub mod metrics;
pub mod puller;
pub mod pullers;
pub mod reconcile;
pub mod review;
pub mod store;
pub mod utilization;
