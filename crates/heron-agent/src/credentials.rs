//! Basic-Auth credentials for the Kea Control Agent.
//!
//! The store maps `(canonical IP, port)` to a user/password pair. Keys are
//! always canonicalized, so any syntactic variant of the same address
//! reaches the same record. The store persists as a single JSON file of
//! the shape `{ "basic_auth": [ { ip, port, user, password }, ... ] }`.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use heron_common::addr::{canonicalize_ip, AddrError};

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error(transparent)]
    Address(#[from] AddrError),
    #[error("malformed credentials file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A user/password pair for HTTP Basic Auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(user: &str, password: &str) -> Self {
        BasicAuth {
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsEntry {
    ip: String,
    port: u16,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    basic_auth: Vec<CredentialsEntry>,
}

/// Thread-safe credentials store keyed by canonical `(ip, port)`.
#[derive(Debug, Default)]
pub struct CredentialsStore {
    basic_auth: Mutex<HashMap<(String, u16), BasicAuth>>,
}

impl CredentialsStore {
    pub fn new() -> Self {
        CredentialsStore::default()
    }

    /// Insert or replace the credentials for `(ip, port)`. Only parseable
    /// literal addresses are accepted.
    pub fn add_or_update_basic_auth(
        &self,
        ip: &str,
        port: u16,
        credentials: BasicAuth,
    ) -> Result<(), CredentialsError> {
        let key = canonicalize_ip(ip)?;
        let mut map = self.basic_auth.lock().unwrap();
        map.insert((key, port), credentials);
        Ok(())
    }

    /// Credentials for `(ip, port)`, matching any syntactic variant of
    /// the stored address. `None` for unknown targets or unparseable
    /// addresses.
    pub fn get_basic_auth(&self, ip: &str, port: u16) -> Option<BasicAuth> {
        let key = canonicalize_ip(ip).ok()?;
        let map = self.basic_auth.lock().unwrap();
        map.get(&(key, port)).cloned()
    }

    /// Credentials for the target of `url`. The URL matches only when its
    /// scheme is http or https, its host is a literal IP, and its port is
    /// explicit. Path, query, and fragment do not affect the lookup.
    pub fn get_basic_auth_by_url(&self, url: &str) -> Option<BasicAuth> {
        let parsed = Url::parse(url).ok()?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return None;
        }
        let host = match parsed.host()? {
            Host::Ipv4(addr) => addr.to_string(),
            Host::Ipv6(addr) => addr.to_string(),
            Host::Domain(_) => return None,
        };
        let port = explicit_port(url)?;
        self.get_basic_auth(&host, port)
    }

    /// Remove the credentials for `(ip, port)`. Idempotent; unparseable
    /// addresses are ignored.
    pub fn remove_basic_auth(&self, ip: &str, port: u16) {
        if let Ok(key) = canonicalize_ip(ip) {
            let mut map = self.basic_auth.lock().unwrap();
            map.remove(&(key, port));
        }
    }

    /// Replace the store content with the parsed `reader` document.
    /// Strict JSON: unquoted keys, a missing or non-numeric `port`, and
    /// empty content all fail, leaving the store untouched.
    pub fn read(&self, reader: impl Read) -> Result<(), CredentialsError> {
        let file: CredentialsFile = serde_json::from_reader(reader)?;

        let mut parsed = HashMap::with_capacity(file.basic_auth.len());
        for entry in file.basic_auth {
            let key = canonicalize_ip(&entry.ip)?;
            parsed.insert(
                (key, entry.port),
                BasicAuth {
                    user: entry.user,
                    password: entry.password,
                },
            );
        }

        let mut map = self.basic_auth.lock().unwrap();
        *map = parsed;
        Ok(())
    }

    /// Load the store from `path`. A missing file leaves the store empty
    /// and is not an error; agents without Kea authentication have none.
    pub fn load_if_exists(&self, path: &Path) -> Result<(), CredentialsError> {
        if !path.exists() {
            return Ok(());
        }
        let file = std::fs::File::open(path)?;
        self.read(file)
    }

    pub fn len(&self) -> usize {
        self.basic_auth.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The explicit port of a URL's authority. `Url::port()` erases a default
/// port (`:80`, `:443`); the lookup contract requires the port to be
/// spelled out, so recover it from the raw text.
fn explicit_port(raw: &str) -> Option<u16> {
    let after_scheme = raw.split("://").nth(1)?;
    let authority = after_scheme.split(['/', '?', '#']).next()?;
    let port = if let Some(rest) = authority.strip_prefix('[') {
        rest.rsplit_once(']')?.1.strip_prefix(':')?
    } else {
        authority.rsplit_once(':')?.1
    };
    port.parse().ok()
}
