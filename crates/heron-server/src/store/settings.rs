//! The settings table: puller intervals and operational knobs.
//!
//! Interval settings are read by the scheduler on every tick, so changes
//! take effect at the next boundary. Zero or a negative value disables
//! the puller.

use rusqlite::{params, Connection, OptionalExtension};

use super::Result;

/// `(name, default)` pairs seeded at startup when absent.
pub const DEFAULT_INTERVALS: &[(&str, i64)] = &[
    ("machine_state_puller_interval", 60),
    ("apps_state_puller_interval", 30),
    ("kea_stats_puller_interval", 60),
    ("kea_hosts_puller_interval", 300),
    ("kea_status_puller_interval", 10),
    ("config_review_puller_interval", 86400),
];

/// Number of events kept by the retention trim.
pub const DEFAULT_EVENT_RETENTION: (&str, i64) = ("event_retention_count", 10000);

pub fn get(conn: &Connection, name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM setting WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn get_int(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(get(conn, name)?.and_then(|value| value.parse().ok()))
}

pub fn set(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO setting (name, value) VALUES (?1, ?2) \
         ON CONFLICT (name) DO UPDATE SET value = ?2",
        params![name, value],
    )?;
    Ok(())
}

/// Seed default values without overwriting operator changes.
pub fn seed_defaults(conn: &Connection) -> Result<()> {
    for (name, value) in DEFAULT_INTERVALS
        .iter()
        .chain(std::iter::once(&DEFAULT_EVENT_RETENTION))
    {
        conn.execute(
            "INSERT OR IGNORE INTO setting (name, value) VALUES (?1, ?2)",
            params![name, value.to_string()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;

    #[test]
    fn seed_does_not_overwrite() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.connection();
        set(&conn, "machine_state_puller_interval", "120").unwrap();
        seed_defaults(&conn).unwrap();
        assert_eq!(
            get_int(&conn, "machine_state_puller_interval").unwrap(),
            Some(120)
        );
        assert_eq!(get_int(&conn, "kea_stats_puller_interval").unwrap(), Some(60));
    }

    #[test]
    fn get_int_parses_or_none() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.connection();
        set(&conn, "x", "42").unwrap();
        set(&conn, "y", "frogs").unwrap();
        assert_eq!(get_int(&conn, "x").unwrap(), Some(42));
        assert_eq!(get_int(&conn, "y").unwrap(), None);
        assert_eq!(get_int(&conn, "missing").unwrap(), None);
    }
}
