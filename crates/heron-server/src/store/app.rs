//! App and daemon models.
//!
//! An app is a service instance on a machine (`kea` or `bind9`) with an
//! ordered set of access points. The control access point is the app's
//! stable identity within its machine. A daemon is a monitorable process
//! inside an app, unique by `(app_id, name)`; `monitored` survives
//! rediscovery.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{Result, StoreError};

pub const APP_TYPE_KEA: &str = "kea";
pub const APP_TYPE_BIND9: &str = "bind9";

pub const ACCESS_POINT_CONTROL: &str = "control";
pub const ACCESS_POINT_STATISTICS: &str = "statistics";

/// Kea daemon names.
pub const DAEMON_DHCP4: &str = "dhcp4";
pub const DAEMON_DHCP6: &str = "dhcp6";
pub const DAEMON_CA: &str = "ca";
pub const DAEMON_D2: &str = "d2";
pub const DAEMON_NAMED: &str = "named";

#[derive(Debug, Clone, Serialize)]
pub struct AccessPoint {
    pub app_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub port: u16,
    pub key: Option<String>,
    pub use_secure_protocol: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct App {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub machine_id: i64,
    #[serde(rename = "type")]
    pub app_type: String,
    pub active: bool,
    pub access_points: Vec<AccessPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Daemon {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub app_id: i64,
    pub name: String,
    pub active: bool,
    pub monitored: bool,
    pub version: Option<String>,
    pub uptime: Option<i64>,
    pub reloaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reload_count: i64,
    #[serde(skip)]
    pub config: Option<serde_json::Value>,
    #[serde(skip)]
    pub config_hash: Option<String>,
}

fn app_from_row(row: &Row) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        machine_id: row.get("machine_id")?,
        app_type: row.get("type")?,
        active: row.get("active")?,
        access_points: Vec::new(),
    })
}

fn daemon_from_row(row: &Row) -> rusqlite::Result<Daemon> {
    let config: Option<String> = row.get("config")?;
    Ok(Daemon {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        app_id: row.get("app_id")?,
        name: row.get("name")?,
        active: row.get("active")?,
        monitored: row.get("monitored")?,
        version: row.get("version")?,
        uptime: row.get("uptime")?,
        reloaded_at: row.get("reloaded_at")?,
        last_error: row.get("last_error")?,
        reload_count: row.get("reload_count")?,
        config: config.and_then(|text| serde_json::from_str(&text).ok()),
        config_hash: row.get("config_hash")?,
    })
}

const APP_COLUMNS: &str = "id, created_at, machine_id, type, active";
const DAEMON_COLUMNS: &str = "id, created_at, app_id, name, active, monitored, version, uptime, \
     reloaded_at, last_error, reload_count, config, config_hash";

fn load_access_points(conn: &Connection, app: &mut App) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT app_id, type, address, port, key, use_secure_protocol \
         FROM access_point WHERE app_id = ?1 ORDER BY type",
    )?;
    app.access_points = stmt
        .query_map([app.id], |row| {
            Ok(AccessPoint {
                app_id: row.get("app_id")?,
                kind: row.get("type")?,
                address: row.get("address")?,
                port: row.get("port")?,
                key: row.get("key")?,
                use_secure_protocol: row.get("use_secure_protocol")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(())
}

pub fn get_app(conn: &Connection, id: i64) -> Result<App> {
    let mut app = conn
        .query_row(
            &format!("SELECT {APP_COLUMNS} FROM app WHERE id = ?1"),
            [id],
            app_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound("app"))?;
    load_access_points(conn, &mut app)?;
    Ok(app)
}

pub fn list_apps(
    conn: &Connection,
    offset: i64,
    limit: i64,
    machine_id: Option<i64>,
    app_type: Option<&str>,
) -> Result<(Vec<App>, i64)> {
    let mut filters = Vec::new();
    if machine_id.is_some() {
        filters.push("machine_id = :machine_id");
    }
    if app_type.is_some() {
        filters.push("type = :app_type");
    }
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" AND "))
    };

    let named: Vec<(&str, &dyn rusqlite::ToSql)> = {
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if let Some(ref id) = machine_id {
            named.push((":machine_id", id));
        }
        if let Some(ref app_type) = app_type {
            named.push((":app_type", app_type));
        }
        named
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM app{where_clause}"),
        named.as_slice(),
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {APP_COLUMNS} FROM app{where_clause} ORDER BY id LIMIT {limit} OFFSET {offset}"
    ))?;
    let mut apps = stmt
        .query_map(named.as_slice(), app_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for app in &mut apps {
        load_access_points(conn, app)?;
    }
    Ok((apps, total))
}

/// The control access point of an app, when present.
pub fn control_point(app: &App) -> Option<&AccessPoint> {
    app.access_points
        .iter()
        .find(|point| point.kind == ACCESS_POINT_CONTROL)
}

/// Upsert an app by `(machine_id, type, control address, control port)`.
/// Access points are replaced as a set. Returns the app id.
pub fn upsert_app(
    conn: &Connection,
    machine_id: i64,
    app_type: &str,
    access_points: &[AccessPoint],
) -> Result<i64> {
    let control = access_points
        .iter()
        .find(|point| point.kind == ACCESS_POINT_CONTROL)
        .ok_or_else(|| StoreError::Conflict("app without control access point".into()))?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT app.id FROM app \
             JOIN access_point ON access_point.app_id = app.id \
             WHERE app.machine_id = ?1 AND app.type = ?2 \
               AND access_point.type = 'control' \
               AND access_point.address = ?3 AND access_point.port = ?4",
            params![machine_id, app_type, control.address, control.port],
            |row| row.get(0),
        )
        .optional()?;

    let app_id = match existing {
        Some(id) => {
            conn.execute("UPDATE app SET active = 1 WHERE id = ?1", [id])?;
            id
        }
        None => {
            conn.execute(
                "INSERT INTO app (created_at, machine_id, type, active) VALUES (?1, ?2, ?3, 1)",
                params![Utc::now(), machine_id, app_type],
            )?;
            conn.last_insert_rowid()
        }
    };

    conn.execute("DELETE FROM access_point WHERE app_id = ?1", [app_id])?;
    for point in access_points {
        conn.execute(
            "INSERT INTO access_point (app_id, type, address, port, key, use_secure_protocol) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app_id,
                point.kind,
                point.address,
                point.port,
                point.key,
                point.use_secure_protocol
            ],
        )?;
    }
    Ok(app_id)
}

/// Delete this machine's apps that are not in `seen_app_ids`.
pub fn delete_unseen_apps(conn: &Connection, machine_id: i64, seen_app_ids: &[i64]) -> Result<u64> {
    let placeholders = std::iter::repeat("?")
        .take(seen_app_ids.len())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = if seen_app_ids.is_empty() {
        "DELETE FROM app WHERE machine_id = ?1".to_string()
    } else {
        format!("DELETE FROM app WHERE machine_id = ?1 AND id NOT IN ({placeholders})")
    };
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&machine_id];
    for id in seen_app_ids {
        values.push(id);
    }
    let deleted = conn.execute(&sql, values.as_slice())?;
    Ok(deleted as u64)
}

/// Upsert a daemon by `(app_id, name)`, preserving `monitored` across
/// rediscoveries. Returns the daemon id.
pub fn upsert_daemon(conn: &Connection, app_id: i64, name: &str, active: bool) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM daemon WHERE app_id = ?1 AND name = ?2",
            params![app_id, name],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE daemon SET active = ?2 WHERE id = ?1",
                params![id, active],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO daemon (created_at, app_id, name, active, monitored) \
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![Utc::now(), app_id, name, active],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

pub fn get_daemon(conn: &Connection, id: i64) -> Result<Daemon> {
    conn.query_row(
        &format!("SELECT {DAEMON_COLUMNS} FROM daemon WHERE id = ?1"),
        [id],
        daemon_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound("daemon"))
}

pub fn daemons_of_app(conn: &Connection, app_id: i64) -> Result<Vec<Daemon>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DAEMON_COLUMNS} FROM daemon WHERE app_id = ?1 ORDER BY name"
    ))?;
    let result = stmt
        .query_map([app_id], daemon_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(result)
}

/// All monitored Kea DHCP daemons (the subjects of the stats, hosts, HA,
/// and review pullers).
pub fn monitored_dhcp_daemons(conn: &Connection) -> Result<Vec<Daemon>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DAEMON_COLUMNS} FROM daemon \
         WHERE monitored AND active AND name IN ('dhcp4', 'dhcp6') ORDER BY id"
    ))?;
    let result = stmt
        .query_map([], daemon_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(result)
}

pub fn set_monitored(conn: &Connection, id: i64, monitored: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE daemon SET monitored = ?2 WHERE id = ?1",
        params![id, monitored],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound("daemon"));
    }
    Ok(())
}

/// Record daemon status from a `status-get`/`version-get` sweep. A lower
/// uptime than last observed counts as a reload.
pub fn update_daemon_state(
    conn: &Connection,
    id: i64,
    version: Option<&str>,
    uptime: Option<i64>,
    last_error: Option<&str>,
) -> Result<()> {
    let previous_uptime: Option<i64> = conn
        .query_row("SELECT uptime FROM daemon WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();

    let reloaded = match (previous_uptime, uptime) {
        (Some(previous), Some(current)) => current < previous,
        _ => false,
    };
    if reloaded {
        conn.execute(
            "UPDATE daemon SET reload_count = reload_count + 1, reloaded_at = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
    }
    conn.execute(
        "UPDATE daemon SET version = ?2, uptime = ?3, last_error = ?4, \
         active = ?5 WHERE id = ?1",
        params![id, version, uptime, last_error, last_error.is_none()],
    )?;
    Ok(())
}

/// Store a daemon configuration. Returns `true` when the digest changed,
/// which is the config-review trigger.
pub fn update_daemon_config(
    conn: &Connection,
    id: i64,
    config: &serde_json::Value,
) -> Result<bool> {
    let text = serde_json::to_string(config)?;
    let hash = heron_transport::material::sha256_hex(text.as_bytes());
    let previous: Option<String> = conn
        .query_row("SELECT config_hash FROM daemon WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();
    let changed = previous.as_deref() != Some(hash.as_str());
    conn.execute(
        "UPDATE daemon SET config = ?2, config_hash = ?3 WHERE id = ?1",
        params![id, text, hash],
    )?;
    Ok(changed)
}

/// The last observed High-Availability state of a DHCP daemon.
#[derive(Debug, Clone, Serialize)]
pub struct HaService {
    pub daemon_id: i64,
    pub ha_state: Option<String>,
    pub partner_state: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

pub fn update_ha_service(
    conn: &Connection,
    daemon_id: i64,
    ha_state: Option<&str>,
    partner_state: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ha_service (daemon_id, ha_state, partner_state, checked_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (daemon_id) DO UPDATE SET ha_state = ?2, partner_state = ?3, checked_at = ?4",
        params![daemon_id, ha_state, partner_state, Utc::now()],
    )?;
    Ok(())
}

pub fn get_ha_service(conn: &Connection, daemon_id: i64) -> Result<Option<HaService>> {
    Ok(conn
        .query_row(
            "SELECT daemon_id, ha_state, partner_state, checked_at \
             FROM ha_service WHERE daemon_id = ?1",
            [daemon_id],
            |row| {
                Ok(HaService {
                    daemon_id: row.get("daemon_id")?,
                    ha_state: row.get("ha_state")?,
                    partner_state: row.get("partner_state")?,
                    checked_at: row.get("checked_at")?,
                })
            },
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{machine, Db};

    fn control(address: &str, port: u16) -> AccessPoint {
        AccessPoint {
            app_id: 0,
            kind: ACCESS_POINT_CONTROL.to_string(),
            address: address.to_string(),
            port,
            key: None,
            use_secure_protocol: false,
        }
    }

    fn setup() -> (Db, i64) {
        let db = Db::open_in_memory().unwrap();
        let m = machine::add(&db.connection(), "192.0.2.1", 8140, "fp").unwrap();
        (db, m.id)
    }

    #[test]
    fn upsert_app_is_idempotent_by_control_point() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let first =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        let second =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        assert_eq!(first, second);

        // A different control port is a different app.
        let third =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8001)]).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn upsert_app_requires_control_point() {
        let (db, machine_id) = setup();
        let err = upsert_app(&db.connection(), machine_id, APP_TYPE_KEA, &[]).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn delete_unseen_apps_prunes() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let keep =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        let drop =
            upsert_app(&conn, machine_id, APP_TYPE_BIND9, &[control("127.0.0.1", 953)]).unwrap();

        let deleted = delete_unseen_apps(&conn, machine_id, &[keep]).unwrap();
        assert_eq!(deleted, 1);
        assert!(get_app(&conn, keep).is_ok());
        assert!(matches!(
            get_app(&conn, drop),
            Err(StoreError::NotFound("app"))
        ));
    }

    #[test]
    fn daemon_monitored_survives_rediscovery() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let app_id =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        let daemon_id = upsert_daemon(&conn, app_id, DAEMON_DHCP4, true).unwrap();
        set_monitored(&conn, daemon_id, false).unwrap();

        let rediscovered = upsert_daemon(&conn, app_id, DAEMON_DHCP4, true).unwrap();
        assert_eq!(rediscovered, daemon_id);
        assert!(!get_daemon(&conn, daemon_id).unwrap().monitored);
    }

    #[test]
    fn uptime_regression_counts_as_reload() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let app_id =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        let daemon_id = upsert_daemon(&conn, app_id, DAEMON_DHCP4, true).unwrap();

        update_daemon_state(&conn, daemon_id, Some("2.4.0"), Some(100), None).unwrap();
        update_daemon_state(&conn, daemon_id, Some("2.4.0"), Some(200), None).unwrap();
        assert_eq!(get_daemon(&conn, daemon_id).unwrap().reload_count, 0);

        update_daemon_state(&conn, daemon_id, Some("2.4.0"), Some(10), None).unwrap();
        let daemon = get_daemon(&conn, daemon_id).unwrap();
        assert_eq!(daemon.reload_count, 1);
        assert!(daemon.reloaded_at.is_some());
    }

    #[test]
    fn config_update_reports_digest_change() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let app_id =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        let daemon_id = upsert_daemon(&conn, app_id, DAEMON_DHCP4, true).unwrap();

        let config = serde_json::json!({"Dhcp4": {}});
        assert!(update_daemon_config(&conn, daemon_id, &config).unwrap());
        assert!(!update_daemon_config(&conn, daemon_id, &config).unwrap());

        let changed = serde_json::json!({"Dhcp4": {"subnet4": []}});
        assert!(update_daemon_config(&conn, daemon_id, &changed).unwrap());
        assert!(get_daemon(&conn, daemon_id).unwrap().config.is_some());
    }

    #[test]
    fn ha_service_upserts_in_place() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let app_id =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        let daemon_id = upsert_daemon(&conn, app_id, DAEMON_DHCP4, true).unwrap();

        assert!(get_ha_service(&conn, daemon_id).unwrap().is_none());
        update_ha_service(&conn, daemon_id, Some("load-balancing"), Some("hot-standby")).unwrap();
        update_ha_service(&conn, daemon_id, Some("partner-down"), None).unwrap();
        let ha = get_ha_service(&conn, daemon_id).unwrap().unwrap();
        assert_eq!(ha.ha_state.as_deref(), Some("partner-down"));
        assert_eq!(ha.partner_state, None);
        assert!(ha.checked_at.is_some());
    }

    #[test]
    fn monitored_dhcp_daemons_filters_names() {
        let (db, machine_id) = setup();
        let conn = db.connection();
        let app_id =
            upsert_app(&conn, machine_id, APP_TYPE_KEA, &[control("127.0.0.1", 8000)]).unwrap();
        upsert_daemon(&conn, app_id, DAEMON_DHCP4, true).unwrap();
        upsert_daemon(&conn, app_id, DAEMON_CA, true).unwrap();
        let d6 = upsert_daemon(&conn, app_id, DAEMON_DHCP6, true).unwrap();
        set_monitored(&conn, d6, false).unwrap();

        let daemons = monitored_dhcp_daemons(&conn).unwrap();
        assert_eq!(daemons.len(), 1);
        assert_eq!(daemons[0].name, DAEMON_DHCP4);
    }
}
