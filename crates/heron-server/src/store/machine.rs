//! Machine model.
//!
//! A machine is a managed host, uniquely identified by
//! `(address, agent_port)`. It is created pending (`authorized = false`)
//! by agent registration and becomes active when an administrator
//! authorizes it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{Result, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct Machine {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub address: String,
    pub agent_port: u16,
    pub authorized: bool,
    pub last_error: Option<String>,
    pub agent_token_fingerprint: Option<String>,
    pub agent_version: Option<String>,
    pub hostname: Option<String>,
    pub last_visited_at: Option<DateTime<Utc>>,
}

fn machine_from_row(row: &Row) -> rusqlite::Result<Machine> {
    Ok(Machine {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        address: row.get("address")?,
        agent_port: row.get("agent_port")?,
        authorized: row.get("authorized")?,
        last_error: row.get("last_error")?,
        agent_token_fingerprint: row.get("agent_token_fingerprint")?,
        agent_version: row.get("agent_version")?,
        hostname: row.get("hostname")?,
        last_visited_at: row.get("last_visited_at")?,
    })
}

const MACHINE_COLUMNS: &str = "id, created_at, address, agent_port, authorized, last_error, \
     agent_token_fingerprint, agent_version, hostname, last_visited_at";

/// Insert a pending machine. Fails with `Conflict` when another machine
/// already claims `(address, agent_port)`.
pub fn add(
    conn: &Connection,
    address: &str,
    agent_port: u16,
    token_fingerprint: &str,
) -> Result<Machine> {
    conn.execute(
        "INSERT INTO machine (created_at, address, agent_port, authorized, agent_token_fingerprint) \
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![Utc::now(), address, agent_port, token_fingerprint],
    )?;
    get(conn, conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Machine> {
    conn.query_row(
        &format!("SELECT {MACHINE_COLUMNS} FROM machine WHERE id = ?1"),
        [id],
        machine_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound("machine"))
}

pub fn get_by_address(conn: &Connection, address: &str, agent_port: u16) -> Result<Option<Machine>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {MACHINE_COLUMNS} FROM machine WHERE address = ?1 AND agent_port = ?2"
            ),
            params![address, agent_port],
            machine_from_row,
        )
        .optional()?)
}

pub fn list(
    conn: &Connection,
    offset: i64,
    limit: i64,
    authorized: Option<bool>,
) -> Result<(Vec<Machine>, i64)> {
    let filter = match authorized {
        Some(true) => " WHERE authorized",
        Some(false) => " WHERE NOT authorized",
        None => "",
    };
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM machine{filter}"),
        [],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {MACHINE_COLUMNS} FROM machine{filter} ORDER BY id LIMIT ?1 OFFSET ?2"
    ))?;
    let machines = stmt
        .query_map(params![limit, offset], machine_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((machines, total))
}

pub fn list_authorized(conn: &Connection) -> Result<Vec<Machine>> {
    let (machines, _) = list(conn, 0, i64::MAX, Some(true))?;
    Ok(machines)
}

pub fn set_authorized(conn: &Connection, id: i64, authorized: bool) -> Result<Machine> {
    let updated = conn.execute(
        "UPDATE machine SET authorized = ?2 WHERE id = ?1",
        params![id, authorized],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound("machine"));
    }
    get(conn, id)
}

/// Record the outcome of the last contact attempt: `None` clears the
/// error and stamps `last_visited_at`.
pub fn set_last_error(conn: &Connection, id: i64, error: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE machine SET last_error = ?2, last_visited_at = ?3 WHERE id = ?1",
        params![id, error, Utc::now()],
    )?;
    Ok(())
}

pub fn update_state(
    conn: &Connection,
    id: i64,
    hostname: Option<&str>,
    agent_version: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE machine SET hostname = ?2, agent_version = ?3, last_error = NULL, \
         last_visited_at = ?4 WHERE id = ?1",
        params![id, hostname, agent_version, Utc::now()],
    )?;
    Ok(())
}

/// Remove a machine. Apps, daemons, and join rows cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    let deleted = conn.execute("DELETE FROM machine WHERE id = ?1", [id])?;
    if deleted == 0 {
        return Err(StoreError::NotFound("machine"));
    }
    Ok(())
}
