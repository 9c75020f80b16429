//! Host reservation model.
//!
//! A host is identified by its owning subnet (or none for global
//! reservations) and its ordered identifier set. Per-daemon `LocalHost`
//! join rows carry the data source (`config` or `api`) and the DHCP
//! option set with a digest used to coalesce identical option sets.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{Result, StoreError};

pub const SOURCE_CONFIG: &str = "config";
pub const SOURCE_API: &str = "api";

#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    /// Hex without separators, lowercase.
    pub value: String,
}

impl HostIdentifier {
    /// Normalize an identifier value: strip `:`/`-` separators, lowercase.
    pub fn new(kind: &str, value: &str) -> HostIdentifier {
        HostIdentifier {
            kind: kind.to_string(),
            value: value.replace([':', '-'], "").to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalHost {
    pub host_id: i64,
    pub daemon_id: i64,
    pub data_source: String,
    pub options: Option<serde_json::Value>,
    pub options_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub subnet_id: Option<i64>,
    pub hostname: Option<String>,
    pub identifiers: Vec<HostIdentifier>,
    pub ip_reservations: Vec<String>,
    pub local_hosts: Vec<LocalHost>,
}

/// Stable digest over the canonicalized option sequence: each option is
/// serialized with sorted keys, the sequence is sorted, then hashed.
pub fn options_hash(options: &[serde_json::Value]) -> String {
    let mut rendered: Vec<String> = options
        .iter()
        .map(|option| serde_json::to_string(option).unwrap_or_default())
        .collect();
    rendered.sort();
    hex::encode(Sha256::digest(rendered.join("\n").as_bytes()))
}

fn load_host(conn: &Connection, id: i64) -> Result<Host> {
    let mut host = conn
        .query_row(
            "SELECT id, created_at, subnet_id, hostname FROM host WHERE id = ?1",
            [id],
            |row| {
                Ok(Host {
                    id: row.get("id")?,
                    created_at: row.get("created_at")?,
                    subnet_id: row.get("subnet_id")?,
                    hostname: row.get("hostname")?,
                    identifiers: Vec::new(),
                    ip_reservations: Vec::new(),
                    local_hosts: Vec::new(),
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound("host"))?;

    let mut stmt = conn.prepare(
        "SELECT type, value FROM host_identifier WHERE host_id = ?1 ORDER BY id",
    )?;
    host.identifiers = stmt
        .query_map([id], |row| {
            Ok(HostIdentifier {
                kind: row.get("type")?,
                value: row.get("value")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt =
        conn.prepare("SELECT address FROM ip_reservation WHERE host_id = ?1 ORDER BY id")?;
    host.ip_reservations = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT host_id, daemon_id, data_source, options, options_hash \
         FROM local_host WHERE host_id = ?1 ORDER BY daemon_id",
    )?;
    host.local_hosts = stmt
        .query_map([id], |row| {
            let options: Option<String> = row.get("options")?;
            Ok(LocalHost {
                host_id: row.get("host_id")?,
                daemon_id: row.get("daemon_id")?,
                data_source: row.get("data_source")?,
                options: options.and_then(|text| serde_json::from_str(&text).ok()),
                options_hash: row.get("options_hash")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(host)
}

pub fn get_host(conn: &Connection, id: i64) -> Result<Host> {
    load_host(conn, id)
}

pub fn list_hosts(conn: &Connection, offset: i64, limit: i64) -> Result<(Vec<Host>, i64)> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM host", [], |row| row.get(0))?;
    let mut stmt = conn.prepare("SELECT id FROM host ORDER BY id LIMIT ?1 OFFSET ?2")?;
    let ids: Vec<i64> = stmt
        .query_map(params![limit, offset], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut hosts = Vec::with_capacity(ids.len());
    for id in ids {
        hosts.push(load_host(conn, id)?);
    }
    Ok((hosts, total))
}

pub fn hosts_of_subnet(conn: &Connection, subnet_id: i64) -> Result<Vec<Host>> {
    let mut stmt = conn.prepare("SELECT id FROM host WHERE subnet_id = ?1 ORDER BY id")?;
    let ids: Vec<i64> = stmt
        .query_map([subnet_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut hosts = Vec::with_capacity(ids.len());
    for id in ids {
        hosts.push(load_host(conn, id)?);
    }
    Ok(hosts)
}

/// True when the subnet has any IP reservation visible to `daemon_id`.
pub fn subnet_has_reservations(conn: &Connection, subnet_id: i64, daemon_id: i64) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ip_reservation \
         JOIN host ON host.id = ip_reservation.host_id \
         JOIN local_host ON local_host.host_id = host.id \
         WHERE host.subnet_id = ?1 AND local_host.daemon_id = ?2",
        params![subnet_id, daemon_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Find a host by `(subnet, identifier set)`; identifier order is
/// insignificant.
fn find_host(
    conn: &Connection,
    subnet_id: Option<i64>,
    identifiers: &[HostIdentifier],
) -> Result<Option<i64>> {
    let mut wanted = identifiers.to_vec();
    wanted.sort();

    let mut stmt = match subnet_id {
        Some(_) => conn.prepare("SELECT id FROM host WHERE subnet_id = ?1")?,
        None => conn.prepare("SELECT id FROM host WHERE subnet_id IS NULL AND ?1 IS NULL")?,
    };
    let ids: Vec<i64> = stmt
        .query_map([subnet_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for id in ids {
        let mut stmt =
            conn.prepare("SELECT type, value FROM host_identifier WHERE host_id = ?1")?;
        let mut existing: Vec<HostIdentifier> = stmt
            .query_map([id], |row| {
                Ok(HostIdentifier {
                    kind: row.get("type")?,
                    value: row.get("value")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        existing.sort();
        if existing == wanted {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Upsert a host by `(subnet_id | null, identifier set)`; reservations
/// are replaced as a set. Returns the host id.
pub fn upsert_host(
    conn: &Connection,
    subnet_id: Option<i64>,
    identifiers: &[HostIdentifier],
    hostname: Option<&str>,
    ip_reservations: &[String],
) -> Result<i64> {
    let host_id = match find_host(conn, subnet_id, identifiers)? {
        Some(id) => {
            conn.execute(
                "UPDATE host SET hostname = ?2 WHERE id = ?1",
                params![id, hostname],
            )?;
            id
        }
        None => {
            conn.execute(
                "INSERT INTO host (created_at, subnet_id, hostname) VALUES (?1, ?2, ?3)",
                params![Utc::now(), subnet_id, hostname],
            )?;
            let id = conn.last_insert_rowid();
            for identifier in identifiers {
                conn.execute(
                    "INSERT INTO host_identifier (host_id, type, value) VALUES (?1, ?2, ?3)",
                    params![id, identifier.kind, identifier.value],
                )?;
            }
            id
        }
    };

    conn.execute("DELETE FROM ip_reservation WHERE host_id = ?1", [host_id])?;
    for address in ip_reservations {
        conn.execute(
            "INSERT INTO ip_reservation (host_id, address) VALUES (?1, ?2)",
            params![host_id, address],
        )?;
    }
    Ok(host_id)
}

/// Attach or refresh the `(host, daemon)` join row.
pub fn upsert_local_host(
    conn: &Connection,
    host_id: i64,
    daemon_id: i64,
    data_source: &str,
    options: &[serde_json::Value],
) -> Result<()> {
    let options_json = if options.is_empty() {
        None
    } else {
        Some(serde_json::to_string(options)?)
    };
    let hash = options_json.as_ref().map(|_| options_hash(options));
    conn.execute(
        "INSERT INTO local_host (host_id, daemon_id, data_source, options, options_hash) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (host_id, daemon_id) DO UPDATE \
         SET data_source = ?3, options = ?4, options_hash = ?5",
        params![host_id, daemon_id, data_source, options_json, hash],
    )?;
    Ok(())
}

/// Delete this daemon's local hosts with `data_source` that are not in
/// `seen_host_ids`, then remove hosts that no daemon references.
pub fn prune_local_hosts(
    conn: &Connection,
    daemon_id: i64,
    data_source: &str,
    seen_host_ids: &[i64],
) -> Result<u64> {
    let placeholders = std::iter::repeat("?")
        .take(seen_host_ids.len())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = if seen_host_ids.is_empty() {
        "DELETE FROM local_host WHERE daemon_id = ?1 AND data_source = ?2".to_string()
    } else {
        format!(
            "DELETE FROM local_host WHERE daemon_id = ?1 AND data_source = ?2 \
             AND host_id NOT IN ({placeholders})"
        )
    };
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&daemon_id, &data_source];
    for id in seen_host_ids {
        values.push(id);
    }
    conn.execute(&sql, values.as_slice())?;

    let deleted = conn.execute(
        "DELETE FROM host WHERE id NOT IN (SELECT DISTINCT host_id FROM local_host)",
        [],
    )?;
    Ok(deleted as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{app, machine, subnet, Db};

    fn setup(db: &Db) -> (i64, i64) {
        let conn = db.connection();
        let m = machine::add(&conn, "192.0.2.1", 8140, "fp").unwrap();
        let app_id = app::upsert_app(
            &conn,
            m.id,
            app::APP_TYPE_KEA,
            &[app::AccessPoint {
                app_id: 0,
                kind: app::ACCESS_POINT_CONTROL.to_string(),
                address: "127.0.0.1".to_string(),
                port: 8000,
                key: None,
                use_secure_protocol: false,
            }],
        )
        .unwrap();
        let daemon_id = app::upsert_daemon(&conn, app_id, app::DAEMON_DHCP4, true).unwrap();
        let subnet_id = subnet::upsert_subnet(&conn, "192.0.2.0/24", None, &[], &[]).unwrap();
        (daemon_id, subnet_id)
    }

    fn hw(value: &str) -> HostIdentifier {
        HostIdentifier::new("hw-address", value)
    }

    #[test]
    fn identifier_values_are_normalized() {
        assert_eq!(hw("01:02:03:04:05:06").value, "010203040506");
        assert_eq!(hw("01-02-03-04-05-06").value, "010203040506");
        assert_eq!(hw("AA:BB").value, "aabb");
    }

    #[test]
    fn upsert_host_matches_by_identifier_set() {
        let db = Db::open_in_memory().unwrap();
        let (_, subnet_id) = setup(&db);
        let conn = db.connection();

        let identifiers = vec![hw("01:02:03:04:05:06"), HostIdentifier::new("duid", "0a0b")];
        let first = upsert_host(
            &conn,
            Some(subnet_id),
            &identifiers,
            Some("frog"),
            &["192.0.2.5".to_string()],
        )
        .unwrap();

        // Same identifiers in another order match the same host.
        let reordered = vec![identifiers[1].clone(), identifiers[0].clone()];
        let second = upsert_host(
            &conn,
            Some(subnet_id),
            &reordered,
            Some("frog"),
            &["192.0.2.5".to_string()],
        )
        .unwrap();
        assert_eq!(first, second);

        let host = get_host(&conn, first).unwrap();
        assert_eq!(host.identifiers.len(), 2);
        assert_eq!(host.ip_reservations, vec!["192.0.2.5"]);
    }

    #[test]
    fn global_hosts_have_no_subnet() {
        let db = Db::open_in_memory().unwrap();
        setup(&db);
        let conn = db.connection();
        let id = upsert_host(&conn, None, &[hw("aa:bb")], None, &[]).unwrap();
        let again = upsert_host(&conn, None, &[hw("aa:bb")], None, &[]).unwrap();
        assert_eq!(id, again);
        assert!(get_host(&conn, id).unwrap().subnet_id.is_none());
    }

    #[test]
    fn options_hash_is_order_insensitive() {
        let a = serde_json::json!({"code": 6, "data": "192.0.2.1"});
        let b = serde_json::json!({"data": "192.0.2.2", "code": 3});
        assert_eq!(
            options_hash(&[a.clone(), b.clone()]),
            options_hash(&[b, a])
        );
    }

    #[test]
    fn local_host_join_and_pruning() {
        let db = Db::open_in_memory().unwrap();
        let (daemon_id, subnet_id) = setup(&db);
        let conn = db.connection();
        let host_id = upsert_host(
            &conn,
            Some(subnet_id),
            &[hw("aa:bb")],
            None,
            &["192.0.2.5".to_string()],
        )
        .unwrap();
        upsert_local_host(
            &conn,
            host_id,
            daemon_id,
            SOURCE_CONFIG,
            &[serde_json::json!({"code": 6})],
        )
        .unwrap();

        let host = get_host(&conn, host_id).unwrap();
        assert_eq!(host.local_hosts.len(), 1);
        assert!(host.local_hosts[0].options_hash.is_some());
        assert!(subnet_has_reservations(&conn, subnet_id, daemon_id).unwrap());

        // An empty sweep removes the join row and the now-orphaned host.
        let deleted = prune_local_hosts(&conn, daemon_id, SOURCE_CONFIG, &[]).unwrap();
        assert_eq!(deleted, 1);
        assert!(get_host(&conn, host_id).is_err());
    }

    #[test]
    fn pruning_one_source_keeps_the_other() {
        let db = Db::open_in_memory().unwrap();
        let (daemon_id, subnet_id) = setup(&db);
        let conn = db.connection();
        let config_host =
            upsert_host(&conn, Some(subnet_id), &[hw("aa:01")], None, &[]).unwrap();
        let api_host = upsert_host(&conn, Some(subnet_id), &[hw("aa:02")], None, &[]).unwrap();
        upsert_local_host(&conn, config_host, daemon_id, SOURCE_CONFIG, &[]).unwrap();
        upsert_local_host(&conn, api_host, daemon_id, SOURCE_API, &[]).unwrap();

        prune_local_hosts(&conn, daemon_id, SOURCE_API, &[]).unwrap();
        assert!(get_host(&conn, config_host).is_ok());
        assert!(get_host(&conn, api_host).is_err());
    }
}
