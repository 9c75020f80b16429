//! Kea configuration model.
//!
//! Kea config files are JSON extended with shell-style `#`, C++-style `//`,
//! and C-style `/* */` comments. This crate strips the comments (they are
//! removed, never interpreted), parses the result, and exposes typed
//! accessors over the daemon configuration: Control Agent connectivity,
//! hook libraries, shared networks, subnets, pools, and host reservations.

mod config;
mod dhcp;

pub use heron_common::comments::strip_comments;
pub use config::{KeaConfig, KeaConfigError};
pub use dhcp::{AddressPool, PdPool, Reservation, SharedNetworkCfg, SubnetCfg};
