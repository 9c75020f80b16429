//! Persisted config-review state: checker enable/disable scopes, review
//! run records, and the reports themselves.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Result;

/// Tri-state of a checker for one scope. A per-daemon `Inherit` is stored
/// as absence of the override row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerState {
    Inherit,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub daemon_id: i64,
    pub checker_name: String,
    /// `None` means the checker ran and found nothing.
    pub content: Option<String>,
    pub ref_daemon_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigReview {
    pub daemon_id: i64,
    pub created_at: DateTime<Utc>,
    pub config_hash: String,
}

// ── Checker scopes ──────────────────────────────────────────────────

pub fn set_global_checker(conn: &Connection, checker_name: &str, enabled: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO config_checker_global (checker_name, enabled) VALUES (?1, ?2) \
         ON CONFLICT (checker_name) DO UPDATE SET enabled = ?2",
        params![checker_name, enabled],
    )?;
    Ok(())
}

/// Global scope: explicit value, else the enabled default.
pub fn global_checker_enabled(conn: &Connection, checker_name: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT enabled FROM config_checker_global WHERE checker_name = ?1",
            [checker_name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(true))
}

pub fn global_checker_states(conn: &Connection) -> Result<Vec<(String, bool)>> {
    let mut stmt =
        conn.prepare("SELECT checker_name, enabled FROM config_checker_global ORDER BY checker_name")?;
    let result = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(result)
}

/// Set a per-daemon override; `Inherit` deletes it.
pub fn set_daemon_checker(
    conn: &Connection,
    daemon_id: i64,
    checker_name: &str,
    state: CheckerState,
) -> Result<()> {
    match state {
        CheckerState::Inherit => {
            conn.execute(
                "DELETE FROM config_checker_daemon WHERE daemon_id = ?1 AND checker_name = ?2",
                params![daemon_id, checker_name],
            )?;
        }
        CheckerState::Enabled | CheckerState::Disabled => {
            conn.execute(
                "INSERT INTO config_checker_daemon (daemon_id, checker_name, enabled) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (daemon_id, checker_name) DO UPDATE SET enabled = ?3",
                params![daemon_id, checker_name, state == CheckerState::Enabled],
            )?;
        }
    }
    Ok(())
}

/// The daemon's own state, without inheritance resolution.
pub fn daemon_checker_own_state(
    conn: &Connection,
    daemon_id: i64,
    checker_name: &str,
) -> Result<CheckerState> {
    let enabled: Option<bool> = conn
        .query_row(
            "SELECT enabled FROM config_checker_daemon \
             WHERE daemon_id = ?1 AND checker_name = ?2",
            params![daemon_id, checker_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match enabled {
        None => CheckerState::Inherit,
        Some(true) => CheckerState::Enabled,
        Some(false) => CheckerState::Disabled,
    })
}

/// Effective state with priority: per-daemon override > global > enabled.
pub fn checker_enabled_for_daemon(
    conn: &Connection,
    daemon_id: i64,
    checker_name: &str,
) -> Result<bool> {
    match daemon_checker_own_state(conn, daemon_id, checker_name)? {
        CheckerState::Enabled => Ok(true),
        CheckerState::Disabled => Ok(false),
        CheckerState::Inherit => global_checker_enabled(conn, checker_name),
    }
}

// ── Review runs and reports ─────────────────────────────────────────

/// Replace the reports of a finished review run.
pub fn store_review(
    conn: &Connection,
    daemon_id: i64,
    config_hash: &str,
    reports: &[(String, Option<String>, Vec<i64>)],
) -> Result<()> {
    conn.execute("DELETE FROM config_report WHERE daemon_id = ?1", [daemon_id])?;
    for (checker_name, content, refs) in reports {
        conn.execute(
            "INSERT INTO config_report (created_at, daemon_id, checker_name, content, \
             ref_daemon_ids) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now(),
                daemon_id,
                checker_name,
                content,
                serde_json::to_string(refs)?
            ],
        )?;
    }
    conn.execute(
        "INSERT INTO config_review (daemon_id, created_at, config_hash) VALUES (?1, ?2, ?3) \
         ON CONFLICT (daemon_id) DO UPDATE SET created_at = ?2, config_hash = ?3",
        params![daemon_id, Utc::now(), config_hash],
    )?;
    Ok(())
}

pub fn get_review(conn: &Connection, daemon_id: i64) -> Result<Option<ConfigReview>> {
    Ok(conn
        .query_row(
            "SELECT daemon_id, created_at, config_hash FROM config_review WHERE daemon_id = ?1",
            [daemon_id],
            |row| {
                Ok(ConfigReview {
                    daemon_id: row.get("daemon_id")?,
                    created_at: row.get("created_at")?,
                    config_hash: row.get("config_hash")?,
                })
            },
        )
        .optional()?)
}

/// Reports of the last run for a daemon; `issues_only` drops the
/// no-finding entries.
pub fn list_reports(
    conn: &Connection,
    daemon_id: i64,
    issues_only: bool,
) -> Result<Vec<ConfigReport>> {
    let filter = if issues_only {
        " AND content IS NOT NULL"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT id, created_at, daemon_id, checker_name, content, ref_daemon_ids \
         FROM config_report WHERE daemon_id = ?1{filter} ORDER BY id"
    ))?;
    let result = stmt
        .query_map([daemon_id], |row| {
            let refs: Option<String> = row.get("ref_daemon_ids")?;
            Ok(ConfigReport {
                id: row.get("id")?,
                created_at: row.get("created_at")?,
                daemon_id: row.get("daemon_id")?,
                checker_name: row.get("checker_name")?,
                content: row.get("content")?,
                ref_daemon_ids: refs
                    .and_then(|text| serde_json::from_str(&text).ok())
                    .unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{app, machine, Db};

    fn setup_daemon(db: &Db) -> i64 {
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
        app::upsert_daemon(&conn, app_id, app::DAEMON_DHCP4, true).unwrap()
    }

    #[test]
    fn checkers_default_to_enabled() {
        let db = Db::open_in_memory().unwrap();
        let daemon_id = setup_daemon(&db);
        let conn = db.connection();
        assert!(global_checker_enabled(&conn, "stat_cmds_presence").unwrap());
        assert!(checker_enabled_for_daemon(&conn, daemon_id, "stat_cmds_presence").unwrap());
        assert_eq!(
            daemon_checker_own_state(&conn, daemon_id, "stat_cmds_presence").unwrap(),
            CheckerState::Inherit
        );
    }

    #[test]
    fn daemon_override_beats_global() {
        let db = Db::open_in_memory().unwrap();
        let daemon_id = setup_daemon(&db);
        let conn = db.connection();
        set_global_checker(&conn, "subnet_dispensable", false).unwrap();
        assert!(!checker_enabled_for_daemon(&conn, daemon_id, "subnet_dispensable").unwrap());

        set_daemon_checker(&conn, daemon_id, "subnet_dispensable", CheckerState::Enabled)
            .unwrap();
        assert!(checker_enabled_for_daemon(&conn, daemon_id, "subnet_dispensable").unwrap());

        // Inherit deletes the override; the global state shows again.
        set_daemon_checker(&conn, daemon_id, "subnet_dispensable", CheckerState::Inherit)
            .unwrap();
        assert!(!checker_enabled_for_daemon(&conn, daemon_id, "subnet_dispensable").unwrap());
        assert_eq!(
            daemon_checker_own_state(&conn, daemon_id, "subnet_dispensable").unwrap(),
            CheckerState::Inherit
        );
    }

    #[test]
    fn review_replaces_previous_reports() {
        let db = Db::open_in_memory().unwrap();
        let daemon_id = setup_daemon(&db);
        let conn = db.connection();
        store_review(
            &conn,
            daemon_id,
            "hash1",
            &[
                ("stat_cmds_presence".into(), Some("finding".into()), vec![daemon_id]),
                ("subnet_dispensable".into(), None, vec![]),
            ],
        )
        .unwrap();
        store_review(
            &conn,
            daemon_id,
            "hash2",
            &[("stat_cmds_presence".into(), None, vec![])],
        )
        .unwrap();

        let reports = list_reports(&conn, daemon_id, false).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].checker_name, "stat_cmds_presence");
        assert!(reports[0].content.is_none());
        assert!(list_reports(&conn, daemon_id, true).unwrap().is_empty());

        let review = get_review(&conn, daemon_id).unwrap().unwrap();
        assert_eq!(review.config_hash, "hash2");
    }
}
