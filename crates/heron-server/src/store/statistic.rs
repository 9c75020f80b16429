//! Named global counters written after each statistics sweep.
//!
//! Values are decimal strings for the same reason subnet statistics are:
//! they can exceed the 64-bit range.

use rusqlite::{params, Connection, OptionalExtension};

use super::Result;

pub fn set(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO statistic (name, value) VALUES (?1, ?2) \
         ON CONFLICT (name) DO UPDATE SET value = ?2",
        params![name, value],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM statistic WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn all(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT name, value FROM statistic ORDER BY name")?;
    let result = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;

    #[test]
    fn set_overwrites_and_lists_sorted() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.connection();
        set(&conn, "total-addresses", "100").unwrap();
        set(&conn, "assigned-addresses", "7").unwrap();
        set(&conn, "total-addresses", "200").unwrap();

        assert_eq!(get(&conn, "total-addresses").unwrap().as_deref(), Some("200"));
        assert_eq!(get(&conn, "missing").unwrap(), None);
        let all = all(&conn).unwrap();
        assert_eq!(all[0].0, "assigned-addresses");
        assert_eq!(all[1].0, "total-addresses");
    }
}
