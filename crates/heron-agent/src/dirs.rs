//! Agent state directory layout.

use std::path::PathBuf;

/// Base directory for agent state. `HERON_AGENT_STATE_DIR` overrides the
/// system default, which keeps tests and unprivileged runs hermetic.
pub fn state_dir() -> PathBuf {
    std::env::var("HERON_AGENT_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/heron-agent"))
}

pub fn token_path() -> PathBuf {
    state_dir().join("server-token.txt")
}

pub fn key_path() -> PathBuf {
    state_dir().join("agent-key.pem")
}

pub fn cert_path() -> PathBuf {
    state_dir().join("agent-cert.pem")
}

pub fn ca_cert_path() -> PathBuf {
    state_dir().join("ca-cert.pem")
}

pub fn credentials_path() -> PathBuf {
    state_dir().join("credentials.json")
}

pub fn ensure_state_dir() -> std::io::Result<PathBuf> {
    let dir = state_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
