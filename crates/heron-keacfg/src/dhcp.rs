//! Typed views over DHCP daemon configuration: shared networks, subnets,
//! pools, and host reservations.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv6Net};
use serde_json::Value;

use heron_common::addr::Family;

/// Reservation identifier types recognized by Kea.
pub const IDENTIFIER_TYPES: &[&str] =
    &["hw-address", "duid", "client-id", "circuit-id", "flex-id"];

/// An address pool with inclusive bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    pub lower: IpAddr,
    pub upper: IpAddr,
}

impl AddressPool {
    /// Parse the Kea pool forms: `"lower - upper"` or a bare CIDR prefix.
    pub fn parse(text: &str) -> Option<AddressPool> {
        let text = text.trim();
        if let Some((lower, upper)) = text.split_once('-') {
            let lower = IpAddr::from_str(lower.trim()).ok()?;
            let upper = IpAddr::from_str(upper.trim()).ok()?;
            return Some(AddressPool { lower, upper });
        }
        let net = IpNet::from_str(text).ok()?.trunc();
        Some(AddressPool {
            lower: net.network(),
            upper: net.broadcast(),
        })
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.lower, self.upper, addr) {
            (IpAddr::V4(lo), IpAddr::V4(hi), IpAddr::V4(a)) => *a >= lo && *a <= hi,
            (IpAddr::V6(lo), IpAddr::V6(hi), IpAddr::V6(a)) => *a >= lo && *a <= hi,
            _ => false,
        }
    }
}

/// A prefix-delegation pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdPool {
    /// The delegated container prefix, e.g. `3001::/16`.
    pub prefix: Ipv6Net,
    /// Length of the prefixes handed out of the pool.
    pub delegated_len: u8,
}

impl PdPool {
    fn from_value(value: &Value) -> Option<PdPool> {
        let prefix = value.get("prefix")?.as_str()?;
        let prefix_len = value.get("prefix-len")?.as_u64()?;
        let delegated_len = value.get("delegated-len")?.as_u64()?;
        let net = Ipv6Net::new(prefix.parse().ok()?, u8::try_from(prefix_len).ok()?)
            .ok()?
            .trunc();
        Some(PdPool {
            prefix: net,
            delegated_len: u8::try_from(delegated_len).ok()?,
        })
    }

    /// A reserved prefix is served from this pool when it lies inside the
    /// container prefix and matches the delegated length.
    pub fn contains_prefix(&self, reservation: &Ipv6Net) -> bool {
        reservation.prefix_len() == self.delegated_len && self.prefix.contains(reservation)
    }
}

/// A host reservation as declared in the configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reservation {
    /// `(identifier type, value)` pairs in declaration order.
    pub identifiers: Vec<(String, String)>,
    pub hostname: Option<String>,
    /// Reserved addresses (`ip-address` and `ip-addresses`).
    pub addresses: Vec<String>,
    /// Reserved delegated prefixes (`prefixes`).
    pub prefixes: Vec<String>,
    /// Raw `option-data` entries.
    pub option_data: Vec<Value>,
}

impl Reservation {
    /// Parse a reservation object, as found in configuration and in
    /// `reservation-get-page` answers.
    pub fn from_value(value: &Value) -> Reservation {
        let mut reservation = Reservation::default();
        for id_type in IDENTIFIER_TYPES {
            if let Some(id) = value.get(*id_type).and_then(Value::as_str) {
                reservation
                    .identifiers
                    .push((id_type.to_string(), id.to_string()));
            }
        }
        reservation.hostname = value
            .get("hostname")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        if let Some(addr) = value.get("ip-address").and_then(Value::as_str) {
            reservation.addresses.push(addr.to_string());
        }
        if let Some(addrs) = value.get("ip-addresses").and_then(Value::as_array) {
            reservation.addresses.extend(
                addrs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
        }
        if let Some(prefixes) = value.get("prefixes").and_then(Value::as_array) {
            reservation.prefixes.extend(
                prefixes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
        }
        if let Some(options) = value.get("option-data").and_then(Value::as_array) {
            reservation.option_data = options.to_vec();
        }
        reservation
    }

    /// A reservation with no address or prefix component is ignored by the
    /// pool analyses.
    pub fn has_ip_component(&self) -> bool {
        !self.addresses.is_empty() || !self.prefixes.is_empty()
    }
}

/// One subnet as declared in the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetCfg {
    /// The daemon-local numeric subnet id, when declared.
    pub local_id: Option<i64>,
    pub prefix: String,
    pub pools: Vec<AddressPool>,
    pub pd_pools: Vec<PdPool>,
    pub reservations: Vec<Reservation>,
    /// Subnet-scope `reservations-out-of-pool` override.
    pub out_of_pool_flag: Option<bool>,
}

impl SubnetCfg {
    fn from_value(value: &Value) -> Option<SubnetCfg> {
        let prefix = value.get("subnet")?.as_str()?.to_string();
        let pools = value
            .get("pools")
            .and_then(Value::as_array)
            .map(|pools| {
                pools
                    .iter()
                    .filter_map(|pool| pool.get("pool").and_then(Value::as_str))
                    .filter_map(AddressPool::parse)
                    .collect()
            })
            .unwrap_or_default();
        let pd_pools = value
            .get("pd-pools")
            .and_then(Value::as_array)
            .map(|pools| pools.iter().filter_map(PdPool::from_value).collect())
            .unwrap_or_default();
        let reservations = value
            .get("reservations")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().map(Reservation::from_value).collect())
            .unwrap_or_default();
        Some(SubnetCfg {
            local_id: value.get("id").and_then(Value::as_i64),
            prefix,
            pools,
            pd_pools,
            reservations,
            out_of_pool_flag: value
                .get("reservations-out-of-pool")
                .and_then(Value::as_bool),
        })
    }

    pub fn has_pools(&self) -> bool {
        !self.pools.is_empty() || !self.pd_pools.is_empty()
    }
}

/// A shared network with its member subnets.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedNetworkCfg {
    pub name: String,
    pub subnets: Vec<SubnetCfg>,
    /// Network-scope `reservations-out-of-pool` override.
    pub out_of_pool_flag: Option<bool>,
}

fn subnet_keys(family: Option<Family>) -> &'static [&'static str] {
    match family {
        Some(Family::V4) => &["subnet4"],
        Some(Family::V6) => &["subnet6"],
        None => &["subnet4", "subnet6"],
    }
}

pub(crate) fn subnets_of(root: &Value, family: Option<Family>) -> Vec<SubnetCfg> {
    let mut subnets = Vec::new();
    for key in subnet_keys(family) {
        if let Some(entries) = root.get(*key).and_then(Value::as_array) {
            subnets.extend(entries.iter().filter_map(SubnetCfg::from_value));
        }
    }
    subnets
}

pub(crate) fn shared_networks_of(root: &Value, family: Option<Family>) -> Vec<SharedNetworkCfg> {
    let Some(networks) = root.get("shared-networks").and_then(Value::as_array) else {
        return Vec::new();
    };
    networks
        .iter()
        .filter_map(|network| {
            let name = network.get("name")?.as_str()?.to_string();
            Some(SharedNetworkCfg {
                name,
                subnets: subnets_of(network, family),
                out_of_pool_flag: network
                    .get("reservations-out-of-pool")
                    .and_then(Value::as_bool),
            })
        })
        .collect()
}
