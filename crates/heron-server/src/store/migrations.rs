//! Schema migrations.
//!
//! The schema is versioned by a single counter in `schema_version`.
//! Migrations are monotonic and each carries its inverse, so `db-down`
//! can walk back to any earlier version.

use rusqlite::Connection;

use super::{Result, StoreError};

pub struct Migration {
    pub version: i64,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up: r#"
            CREATE TABLE machine (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                address TEXT NOT NULL,
                agent_port INTEGER NOT NULL,
                authorized INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                agent_token_fingerprint TEXT,
                agent_version TEXT,
                hostname TEXT,
                last_visited_at TEXT,
                UNIQUE (address, agent_port)
            );

            CREATE TABLE app (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                machine_id INTEGER NOT NULL REFERENCES machine (id) ON DELETE CASCADE,
                type TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE access_point (
                app_id INTEGER NOT NULL REFERENCES app (id) ON DELETE CASCADE,
                type TEXT NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                key TEXT,
                use_secure_protocol INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (app_id, type)
            );

            CREATE TABLE daemon (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                app_id INTEGER NOT NULL REFERENCES app (id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                monitored INTEGER NOT NULL DEFAULT 1,
                version TEXT,
                uptime INTEGER,
                reloaded_at TEXT,
                last_error TEXT,
                reload_count INTEGER NOT NULL DEFAULT 0,
                config TEXT,
                config_hash TEXT,
                UNIQUE (app_id, name)
            );

            CREATE TABLE shared_network (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                name TEXT NOT NULL,
                family INTEGER NOT NULL,
                addr_utilization INTEGER NOT NULL DEFAULT 0,
                pd_utilization INTEGER NOT NULL DEFAULT 0,
                stats TEXT,
                stats_collected_at TEXT,
                UNIQUE (name, family)
            );

            CREATE TABLE subnet (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                prefix TEXT NOT NULL UNIQUE,
                shared_network_id INTEGER REFERENCES shared_network (id) ON DELETE SET NULL,
                addr_utilization INTEGER NOT NULL DEFAULT 0,
                pd_utilization INTEGER NOT NULL DEFAULT 0,
                stats TEXT,
                stats_collected_at TEXT
            );

            CREATE TABLE address_pool (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subnet_id INTEGER NOT NULL REFERENCES subnet (id) ON DELETE CASCADE,
                lower_bound TEXT NOT NULL,
                upper_bound TEXT NOT NULL
            );

            CREATE TABLE prefix_pool (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subnet_id INTEGER NOT NULL REFERENCES subnet (id) ON DELETE CASCADE,
                prefix TEXT NOT NULL,
                delegated_len INTEGER NOT NULL
            );

            CREATE TABLE local_subnet (
                subnet_id INTEGER NOT NULL REFERENCES subnet (id) ON DELETE CASCADE,
                daemon_id INTEGER NOT NULL REFERENCES daemon (id) ON DELETE CASCADE,
                local_subnet_id INTEGER NOT NULL DEFAULT 0,
                stats TEXT,
                stats_collected_at TEXT,
                PRIMARY KEY (subnet_id, daemon_id)
            );

            CREATE TABLE host (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                subnet_id INTEGER REFERENCES subnet (id) ON DELETE CASCADE,
                hostname TEXT
            );

            CREATE TABLE host_identifier (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id INTEGER NOT NULL REFERENCES host (id) ON DELETE CASCADE,
                type TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE TABLE ip_reservation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id INTEGER NOT NULL REFERENCES host (id) ON DELETE CASCADE,
                address TEXT NOT NULL
            );

            CREATE TABLE local_host (
                host_id INTEGER NOT NULL REFERENCES host (id) ON DELETE CASCADE,
                daemon_id INTEGER NOT NULL REFERENCES daemon (id) ON DELETE CASCADE,
                data_source TEXT NOT NULL,
                options TEXT,
                options_hash TEXT,
                PRIMARY KEY (host_id, daemon_id)
            );

            CREATE TABLE event (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                level INTEGER NOT NULL,
                text TEXT NOT NULL,
                details TEXT,
                machine_id INTEGER,
                app_id INTEGER,
                daemon_id INTEGER,
                subnet_id INTEGER,
                user_id INTEGER
            );

            CREATE TABLE setting (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        down: r#"
            DROP TABLE setting;
            DROP TABLE event;
            DROP TABLE local_host;
            DROP TABLE ip_reservation;
            DROP TABLE host_identifier;
            DROP TABLE host;
            DROP TABLE local_subnet;
            DROP TABLE prefix_pool;
            DROP TABLE address_pool;
            DROP TABLE subnet;
            DROP TABLE shared_network;
            DROP TABLE daemon;
            DROP TABLE access_point;
            DROP TABLE app;
            DROP TABLE machine;
        "#,
    },
    Migration {
        version: 2,
        up: r#"
            CREATE TABLE config_report (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                daemon_id INTEGER NOT NULL REFERENCES daemon (id) ON DELETE CASCADE,
                checker_name TEXT NOT NULL,
                content TEXT,
                ref_daemon_ids TEXT
            );

            CREATE TABLE config_review (
                daemon_id INTEGER PRIMARY KEY REFERENCES daemon (id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                config_hash TEXT NOT NULL
            );

            CREATE TABLE config_checker_global (
                checker_name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL
            );

            CREATE TABLE config_checker_daemon (
                daemon_id INTEGER NOT NULL REFERENCES daemon (id) ON DELETE CASCADE,
                checker_name TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                PRIMARY KEY (daemon_id, checker_name)
            );
        "#,
        down: r#"
            DROP TABLE config_checker_daemon;
            DROP TABLE config_checker_global;
            DROP TABLE config_review;
            DROP TABLE config_report;
        "#,
    },
    Migration {
        version: 3,
        up: r#"
            CREATE TABLE ha_service (
                daemon_id INTEGER PRIMARY KEY REFERENCES daemon (id) ON DELETE CASCADE,
                ha_state TEXT,
                partner_state TEXT,
                checked_at TEXT
            );

            CREATE TABLE statistic (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE secret (
                name TEXT PRIMARY KEY,
                content TEXT NOT NULL
            );
        "#,
        down: r#"
            DROP TABLE secret;
            DROP TABLE statistic;
            DROP TABLE ha_service;
        "#,
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
         INSERT INTO schema_version (version)
         SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version);",
    )?;
    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    ensure_version_table(conn)?;
    let version = conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_current_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute("UPDATE schema_version SET version = ?1", [version])?;
    Ok(())
}

/// Apply migrations up to `target` (default: latest).
pub fn migrate_up(conn: &Connection, target: Option<i64>) -> Result<i64> {
    let target = target.unwrap_or_else(latest_version);
    let mut version = current_version(conn)?;
    for migration in MIGRATIONS {
        if migration.version <= version || migration.version > target {
            continue;
        }
        conn.execute_batch(migration.up)
            .map_err(|e| StoreError::Migration(format!("up to {}: {e}", migration.version)))?;
        version = migration.version;
        set_current_version(conn, version)?;
        tracing::info!(version, "Applied schema migration");
    }
    Ok(version)
}

/// Revert migrations down to `target` (0 = empty schema).
pub fn migrate_down(conn: &Connection, target: i64) -> Result<i64> {
    let mut version = current_version(conn)?;
    for migration in MIGRATIONS.iter().rev() {
        if migration.version > version || migration.version <= target {
            continue;
        }
        conn.execute_batch(migration.down)
            .map_err(|e| StoreError::Migration(format!("down from {}: {e}", migration.version)))?;
        version = migration.version - 1;
        set_current_version(conn, version)?;
        tracing::info!(version, "Reverted schema migration");
    }
    Ok(version)
}

/// Force the recorded version without running any migration SQL.
pub fn set_version(conn: &Connection, version: i64) -> Result<()> {
    if version < 0 || version > latest_version() {
        return Err(StoreError::Migration(format!(
            "version {version} out of range 0..={}",
            latest_version()
        )));
    }
    ensure_version_table(conn)?;
    set_current_version(conn, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_monotonic() {
        let mut previous = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > previous);
            previous = migration.version;
        }
    }

    #[test]
    fn up_then_down_leaves_empty_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        migrate_up(&conn, None).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        migrate_down(&conn, 0).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                 AND name != 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn partial_up_stops_at_target() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_up(&conn, Some(1)).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
        // Tables of migration 2 must not exist yet.
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'config_report'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);

        migrate_up(&conn, None).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn set_version_validates_range() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_up(&conn, None).unwrap();
        assert!(set_version(&conn, latest_version() + 1).is_err());
        set_version(&conn, 1).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
    }
}
