use serde_json::Value;

use heron_common::addr::{wildcard_to_loopback, Family};

use heron_common::comments::strip_comments;

use crate::dhcp::{SharedNetworkCfg, SubnetCfg};

/// Root object names that identify the daemon a configuration belongs to.
const ROOT_NAMES: &[&str] = &[
    "Control-agent",
    "Dhcp4",
    "Dhcp6",
    "D2",
    "DhcpDdns",
    "Netconf",
];

/// Default Control Agent HTTP host when the configuration does not set one.
const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum KeaConfigError {
    #[error("empty configuration")]
    Empty,
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A parsed Kea configuration.
///
/// The accessors read the content of the root object (e.g. `Control-agent`
/// or `Dhcp4`). Unknown root names still expose their content so partial
/// configurations remain inspectable.
#[derive(Debug, Clone, PartialEq)]
pub struct KeaConfig {
    root_name: Option<String>,
    root: Value,
}

impl KeaConfig {
    /// Parse a configuration, stripping `#`, `//`, and `/* */` comments
    /// before JSON tokenization.
    pub fn from_json(text: &str) -> Result<KeaConfig, KeaConfigError> {
        if text.trim().is_empty() {
            return Err(KeaConfigError::Empty);
        }
        let stripped = strip_comments(text);
        let parsed: Value = serde_json::from_str(&stripped)?;

        let (root_name, root) = match parsed.as_object() {
            Some(map) => {
                let known = ROOT_NAMES
                    .iter()
                    .find(|name| map.contains_key(**name))
                    .map(|name| name.to_string());
                match &known {
                    Some(name) => (known.clone(), map[name.as_str()].clone()),
                    // Unknown root: expose the first entry's value so the
                    // generic accessors keep working on fragments.
                    None => match map.iter().next() {
                        Some((_, value)) if map.len() == 1 && value.is_object() => {
                            (None, value.clone())
                        }
                        _ => (None, parsed.clone()),
                    },
                }
            }
            None => (None, parsed.clone()),
        };

        Ok(KeaConfig { root_name, root })
    }

    /// Construct from an already-parsed JSON document (e.g. `config-get`
    /// output stored in the database).
    pub fn from_value(parsed: Value) -> KeaConfig {
        let (root_name, root) = match parsed.as_object() {
            Some(map) => {
                let known = ROOT_NAMES
                    .iter()
                    .find(|name| map.contains_key(**name))
                    .map(|name| name.to_string());
                match &known {
                    Some(name) => (known.clone(), map[name.as_str()].clone()),
                    None => (None, parsed.clone()),
                }
            }
            None => (None, parsed.clone()),
        };
        KeaConfig { root_name, root }
    }

    pub fn root_name(&self) -> Option<&str> {
        self.root_name.as_deref()
    }

    pub fn is_control_agent(&self) -> bool {
        self.root_name.as_deref() == Some("Control-agent")
    }

    /// Address family of a DHCP daemon configuration.
    pub fn family(&self) -> Option<Family> {
        match self.root_name.as_deref() {
            Some("Dhcp4") => Some(Family::V4),
            Some("Dhcp6") => Some(Family::V6),
            _ => None,
        }
    }

    /// The raw root object for ad-hoc lookups.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// The configured `http-host`, rewritten so it is a valid connect
    /// target: an empty host or a listening wildcard (`0.0.0.0`, `::`)
    /// becomes the loopback of the same family. `None` when absent.
    pub fn http_host(&self) -> Option<String> {
        let host = self.root.get("http-host")?.as_str()?;
        if host.is_empty() {
            return Some(DEFAULT_HTTP_HOST.to_string());
        }
        Some(wildcard_to_loopback(host))
    }

    /// `http_host()` with the Control Agent default applied.
    pub fn effective_http_host(&self) -> String {
        self.http_host()
            .unwrap_or_else(|| DEFAULT_HTTP_HOST.to_string())
    }

    pub fn http_port(&self) -> Option<u16> {
        self.root
            .get("http-port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
    }

    fn non_empty_str(&self, key: &str) -> Option<&str> {
        self.root
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn trust_anchor(&self) -> Option<&str> {
        self.non_empty_str("trust-anchor")
    }

    pub fn cert_file(&self) -> Option<&str> {
        self.non_empty_str("cert-file")
    }

    pub fn key_file(&self) -> Option<&str> {
        self.non_empty_str("key-file")
    }

    /// HTTPS is in force only when the trust anchor, certificate, and key
    /// are all configured.
    pub fn use_secure_protocol(&self) -> bool {
        self.trust_anchor().is_some() && self.cert_file().is_some() && self.key_file().is_some()
    }

    /// True when a hook library whose file name contains `name` is loaded.
    pub fn has_hook_library(&self, name: &str) -> bool {
        self.root
            .get("hooks-libraries")
            .and_then(Value::as_array)
            .map(|hooks| {
                hooks.iter().any(|hook| {
                    hook.get("library")
                        .and_then(Value::as_str)
                        .is_some_and(|library| library.contains(name))
                })
            })
            .unwrap_or(false)
    }

    /// True when a host backend is configured: a `hosts-database` entry
    /// (object) or a non-empty `hosts-database`/`hosts-databases` array.
    pub fn has_hosts_backend(&self) -> bool {
        for key in ["hosts-database", "hosts-databases"] {
            match self.root.get(key) {
                Some(Value::Object(_)) => return true,
                Some(Value::Array(entries)) if !entries.is_empty() => return true,
                _ => {}
            }
        }
        false
    }

    /// Top-level subnets (`subnet4` or `subnet6` depending on the family).
    pub fn top_level_subnets(&self) -> Vec<SubnetCfg> {
        crate::dhcp::subnets_of(&self.root, self.family())
    }

    /// Shared networks with their member subnets.
    pub fn shared_networks(&self) -> Vec<SharedNetworkCfg> {
        crate::dhcp::shared_networks_of(&self.root, self.family())
    }

    /// All subnets of the daemon: top-level first, then the shared-network
    /// members in declaration order.
    pub fn all_subnets(&self) -> Vec<SubnetCfg> {
        let mut subnets = self.top_level_subnets();
        for network in self.shared_networks() {
            subnets.extend(network.subnets);
        }
        subnets
    }

    /// The global `reservations-out-of-pool` flag (default false).
    pub fn global_reservations_out_of_pool(&self) -> bool {
        self.root
            .get("reservations-out-of-pool")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
