//! Subnet, shared network, pool, and local-subnet models.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use heron_common::addr::Family;
use heron_common::stats::SubnetStats;

use super::{Result, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct SharedNetwork {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub family: u8,
    /// Address utilization in percentage multiplied by 10.
    pub addr_utilization: i16,
    /// Delegated prefix utilization in percentage multiplied by 10.
    pub pd_utilization: i16,
    pub stats: Option<SubnetStats>,
    pub stats_collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressPool {
    pub id: i64,
    pub subnet_id: i64,
    pub lower_bound: String,
    pub upper_bound: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefixPool {
    pub id: i64,
    pub subnet_id: i64,
    pub prefix: String,
    pub delegated_len: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalSubnet {
    pub subnet_id: i64,
    pub daemon_id: i64,
    /// The daemon-local numeric subnet id.
    pub local_subnet_id: i64,
    pub stats: Option<SubnetStats>,
    pub stats_collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subnet {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub prefix: String,
    pub shared_network_id: Option<i64>,
    pub addr_utilization: i16,
    pub pd_utilization: i16,
    pub stats: Option<SubnetStats>,
    pub stats_collected_at: Option<DateTime<Utc>>,
    pub address_pools: Vec<AddressPool>,
    pub prefix_pools: Vec<PrefixPool>,
    pub local_subnets: Vec<LocalSubnet>,
}

impl Subnet {
    pub fn family(&self) -> Family {
        Family::of(&self.prefix)
    }
}

fn stats_from_column(text: Option<String>) -> Option<SubnetStats> {
    text.and_then(|text| serde_json::from_str(&text).ok())
}

fn subnet_from_row(row: &Row) -> rusqlite::Result<Subnet> {
    let stats: Option<String> = row.get("stats")?;
    Ok(Subnet {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        prefix: row.get("prefix")?,
        shared_network_id: row.get("shared_network_id")?,
        addr_utilization: row.get("addr_utilization")?,
        pd_utilization: row.get("pd_utilization")?,
        stats: stats_from_column(stats),
        stats_collected_at: row.get("stats_collected_at")?,
        address_pools: Vec::new(),
        prefix_pools: Vec::new(),
        local_subnets: Vec::new(),
    })
}

const SUBNET_COLUMNS: &str = "id, created_at, prefix, shared_network_id, addr_utilization, \
     pd_utilization, stats, stats_collected_at";

// ── Shared networks ─────────────────────────────────────────────────

/// Upsert a shared network by `(name, family)`. Returns its id.
pub fn upsert_shared_network(conn: &Connection, name: &str, family: Family) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM shared_network WHERE name = ?1 AND family = ?2",
            params![name, family.as_number()],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) => Ok(id),
        None => {
            conn.execute(
                "INSERT INTO shared_network (created_at, name, family) VALUES (?1, ?2, ?3)",
                params![Utc::now(), name, family.as_number()],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

pub fn get_shared_network(conn: &Connection, id: i64) -> Result<SharedNetwork> {
    conn.query_row(
        "SELECT id, created_at, name, family, addr_utilization, pd_utilization, stats, \
         stats_collected_at FROM shared_network WHERE id = ?1",
        [id],
        |row| {
            let stats: Option<String> = row.get("stats")?;
            Ok(SharedNetwork {
                id: row.get("id")?,
                created_at: row.get("created_at")?,
                name: row.get("name")?,
                family: row.get("family")?,
                addr_utilization: row.get("addr_utilization")?,
                pd_utilization: row.get("pd_utilization")?,
                stats: stats_from_column(stats),
                stats_collected_at: row.get("stats_collected_at")?,
            })
        },
    )
    .optional()?
    .ok_or(StoreError::NotFound("shared network"))
}

pub fn list_shared_networks(
    conn: &Connection,
    offset: i64,
    limit: i64,
) -> Result<(Vec<SharedNetwork>, i64)> {
    let total: i64 =
        conn.query_row("SELECT COUNT(*) FROM shared_network", [], |row| row.get(0))?;
    let mut stmt = conn.prepare(
        "SELECT id, created_at, name, family, addr_utilization, pd_utilization, stats, \
         stats_collected_at FROM shared_network ORDER BY id LIMIT ?1 OFFSET ?2",
    )?;
    let networks = stmt
        .query_map(params![limit, offset], |row| {
            let stats: Option<String> = row.get("stats")?;
            Ok(SharedNetwork {
                id: row.get("id")?,
                created_at: row.get("created_at")?,
                name: row.get("name")?,
                family: row.get("family")?,
                addr_utilization: row.get("addr_utilization")?,
                pd_utilization: row.get("pd_utilization")?,
                stats: stats_from_column(stats),
                stats_collected_at: row.get("stats_collected_at")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((networks, total))
}

/// Remove shared networks that no subnet references.
pub fn delete_empty_shared_networks(conn: &Connection) -> Result<u64> {
    let deleted = conn.execute(
        "DELETE FROM shared_network WHERE id NOT IN \
         (SELECT DISTINCT shared_network_id FROM subnet WHERE shared_network_id IS NOT NULL)",
        [],
    )?;
    Ok(deleted as u64)
}

// ── Subnets ─────────────────────────────────────────────────────────

/// Upsert a subnet by its canonical prefix. Pools are replaced as a set.
/// Returns the subnet id.
pub fn upsert_subnet(
    conn: &Connection,
    prefix: &str,
    shared_network_id: Option<i64>,
    address_pools: &[(String, String)],
    prefix_pools: &[(String, u8)],
) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM subnet WHERE prefix = ?1",
            [prefix],
            |row| row.get(0),
        )
        .optional()?;
    let subnet_id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE subnet SET shared_network_id = ?2 WHERE id = ?1",
                params![id, shared_network_id],
            )?;
            id
        }
        None => {
            conn.execute(
                "INSERT INTO subnet (created_at, prefix, shared_network_id) VALUES (?1, ?2, ?3)",
                params![Utc::now(), prefix, shared_network_id],
            )?;
            conn.last_insert_rowid()
        }
    };

    // Pool order is insignificant: replace the whole set.
    conn.execute("DELETE FROM address_pool WHERE subnet_id = ?1", [subnet_id])?;
    for (lower, upper) in address_pools {
        conn.execute(
            "INSERT INTO address_pool (subnet_id, lower_bound, upper_bound) VALUES (?1, ?2, ?3)",
            params![subnet_id, lower, upper],
        )?;
    }
    conn.execute("DELETE FROM prefix_pool WHERE subnet_id = ?1", [subnet_id])?;
    for (pool_prefix, delegated_len) in prefix_pools {
        conn.execute(
            "INSERT INTO prefix_pool (subnet_id, prefix, delegated_len) VALUES (?1, ?2, ?3)",
            params![subnet_id, pool_prefix, delegated_len],
        )?;
    }
    Ok(subnet_id)
}

fn load_subnet_relations(conn: &Connection, subnet: &mut Subnet) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, subnet_id, lower_bound, upper_bound FROM address_pool \
         WHERE subnet_id = ?1 ORDER BY id",
    )?;
    subnet.address_pools = stmt
        .query_map([subnet.id], |row| {
            Ok(AddressPool {
                id: row.get("id")?,
                subnet_id: row.get("subnet_id")?,
                lower_bound: row.get("lower_bound")?,
                upper_bound: row.get("upper_bound")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, subnet_id, prefix, delegated_len FROM prefix_pool \
         WHERE subnet_id = ?1 ORDER BY id",
    )?;
    subnet.prefix_pools = stmt
        .query_map([subnet.id], |row| {
            Ok(PrefixPool {
                id: row.get("id")?,
                subnet_id: row.get("subnet_id")?,
                prefix: row.get("prefix")?,
                delegated_len: row.get("delegated_len")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT subnet_id, daemon_id, local_subnet_id, stats, stats_collected_at \
         FROM local_subnet WHERE subnet_id = ?1 ORDER BY daemon_id",
    )?;
    subnet.local_subnets = stmt
        .query_map([subnet.id], |row| {
            let stats: Option<String> = row.get("stats")?;
            Ok(LocalSubnet {
                subnet_id: row.get("subnet_id")?,
                daemon_id: row.get("daemon_id")?,
                local_subnet_id: row.get("local_subnet_id")?,
                stats: stats_from_column(stats),
                stats_collected_at: row.get("stats_collected_at")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(())
}

pub fn get_subnet(conn: &Connection, id: i64) -> Result<Subnet> {
    let mut subnet = conn
        .query_row(
            &format!("SELECT {SUBNET_COLUMNS} FROM subnet WHERE id = ?1"),
            [id],
            subnet_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound("subnet"))?;
    load_subnet_relations(conn, &mut subnet)?;
    Ok(subnet)
}

pub fn get_subnet_by_prefix(conn: &Connection, prefix: &str) -> Result<Option<Subnet>> {
    let subnet = conn
        .query_row(
            &format!("SELECT {SUBNET_COLUMNS} FROM subnet WHERE prefix = ?1"),
            [prefix],
            subnet_from_row,
        )
        .optional()?;
    match subnet {
        Some(mut subnet) => {
            load_subnet_relations(conn, &mut subnet)?;
            Ok(Some(subnet))
        }
        None => Ok(None),
    }
}

pub fn list_subnets(conn: &Connection, offset: i64, limit: i64) -> Result<(Vec<Subnet>, i64)> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM subnet", [], |row| row.get(0))?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBNET_COLUMNS} FROM subnet ORDER BY id LIMIT ?1 OFFSET ?2"
    ))?;
    let mut subnets = stmt
        .query_map(params![limit, offset], subnet_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for subnet in &mut subnets {
        load_subnet_relations(conn, subnet)?;
    }
    Ok((subnets, total))
}

/// All subnets served by `daemon_id`, relations loaded.
pub fn subnets_of_daemon(conn: &Connection, daemon_id: i64) -> Result<Vec<Subnet>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBNET_COLUMNS} FROM subnet \
         WHERE id IN (SELECT subnet_id FROM local_subnet WHERE daemon_id = ?1) ORDER BY id"
    ))?;
    let mut subnets = stmt
        .query_map([daemon_id], subnet_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for subnet in &mut subnets {
        load_subnet_relations(conn, subnet)?;
    }
    Ok(subnets)
}

// ── Local subnets ───────────────────────────────────────────────────

/// Upsert the `(subnet, daemon)` association; `local_subnet_id` is
/// updated in place on reconciliation.
pub fn upsert_local_subnet(
    conn: &Connection,
    subnet_id: i64,
    daemon_id: i64,
    local_subnet_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO local_subnet (subnet_id, daemon_id, local_subnet_id) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT (subnet_id, daemon_id) DO UPDATE SET local_subnet_id = ?3",
        params![subnet_id, daemon_id, local_subnet_id],
    )?;
    Ok(())
}

/// Resolve a daemon-local numeric subnet id to the global subnet id.
pub fn subnet_id_by_local_id(
    conn: &Connection,
    daemon_id: i64,
    local_subnet_id: i64,
) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT subnet_id FROM local_subnet \
             WHERE daemon_id = ?1 AND local_subnet_id = ?2",
            params![daemon_id, local_subnet_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Delete this daemon's local subnets not in `seen_subnet_ids`.
pub fn prune_local_subnets(
    conn: &Connection,
    daemon_id: i64,
    seen_subnet_ids: &[i64],
) -> Result<u64> {
    let placeholders = std::iter::repeat("?")
        .take(seen_subnet_ids.len())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = if seen_subnet_ids.is_empty() {
        "DELETE FROM local_subnet WHERE daemon_id = ?1".to_string()
    } else {
        format!("DELETE FROM local_subnet WHERE daemon_id = ?1 AND subnet_id NOT IN ({placeholders})")
    };
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&daemon_id];
    for id in seen_subnet_ids {
        values.push(id);
    }
    let deleted = conn.execute(&sql, values.as_slice())?;
    Ok(deleted as u64)
}

/// Remove any subnet with no local subnet. Hosts and pools cascade.
pub fn delete_orphaned_subnets(conn: &Connection) -> Result<u64> {
    let deleted = conn.execute(
        "DELETE FROM subnet WHERE id NOT IN (SELECT DISTINCT subnet_id FROM local_subnet)",
        [],
    )?;
    Ok(deleted as u64)
}

/// Store freshly pulled statistics for one local subnet.
pub fn update_local_subnet_stats(
    conn: &Connection,
    subnet_id: i64,
    daemon_id: i64,
    stats: &SubnetStats,
) -> Result<()> {
    conn.execute(
        "UPDATE local_subnet SET stats = ?3, stats_collected_at = ?4 \
         WHERE subnet_id = ?1 AND daemon_id = ?2",
        params![
            subnet_id,
            daemon_id,
            serde_json::to_string(stats)?,
            Utc::now()
        ],
    )?;
    Ok(())
}

/// Write back calculated utilization for a subnet.
pub fn update_subnet_utilization(
    conn: &Connection,
    subnet_id: i64,
    addr_utilization: i16,
    pd_utilization: i16,
    stats: &SubnetStats,
) -> Result<()> {
    conn.execute(
        "UPDATE subnet SET addr_utilization = ?2, pd_utilization = ?3, stats = ?4, \
         stats_collected_at = ?5 WHERE id = ?1",
        params![
            subnet_id,
            addr_utilization,
            pd_utilization,
            serde_json::to_string(stats)?,
            Utc::now()
        ],
    )?;
    Ok(())
}

/// Write back calculated utilization for a shared network.
pub fn update_shared_network_utilization(
    conn: &Connection,
    shared_network_id: i64,
    addr_utilization: i16,
    pd_utilization: i16,
    stats: &SubnetStats,
) -> Result<()> {
    conn.execute(
        "UPDATE shared_network SET addr_utilization = ?2, pd_utilization = ?3, stats = ?4, \
         stats_collected_at = ?5 WHERE id = ?1",
        params![
            shared_network_id,
            addr_utilization,
            pd_utilization,
            serde_json::to_string(stats)?,
            Utc::now()
        ],
    )?;
    Ok(())
}
