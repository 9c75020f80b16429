//! Named secret material: the fleet CA key/cert, the server key/cert,
//! and the server token. Managed by `heron-tool cert-export`/`cert-import`.

use rusqlite::{params, Connection, OptionalExtension};

use super::{Result, StoreError};

/// The five managed objects.
pub const OBJECTS: &[&str] = &["cakey", "cacert", "srvkey", "srvcert", "srvtkn"];

pub fn is_known_object(name: &str) -> bool {
    OBJECTS.contains(&name)
}

pub fn set(conn: &Connection, name: &str, content: &str) -> Result<()> {
    if !is_known_object(name) {
        return Err(StoreError::NotFound("secret object"));
    }
    conn.execute(
        "INSERT INTO secret (name, content) VALUES (?1, ?2) \
         ON CONFLICT (name) DO UPDATE SET content = ?2",
        params![name, content],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, name: &str) -> Result<Option<String>> {
    if !is_known_object(name) {
        return Err(StoreError::NotFound("secret object"));
    }
    Ok(conn
        .query_row(
            "SELECT content FROM secret WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?)
}
