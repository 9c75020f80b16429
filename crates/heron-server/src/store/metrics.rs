//! Metric values calculated from the database in one snapshot.

use rusqlite::Connection;

use super::Result;

/// Utilization of one subnet or shared network, labelled by prefix or
/// name. Utilization is a percentage multiplied by 10.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMetrics {
    pub label: String,
    pub addr_utilization: i16,
    pub pd_utilization: i16,
}

#[derive(Debug, Clone, Default)]
pub struct CalculatedMetrics {
    pub authorized_machines: i64,
    pub unauthorized_machines: i64,
    pub unreachable_machines: i64,
    pub subnets: Vec<NetworkMetrics>,
    pub shared_networks: Vec<NetworkMetrics>,
}

/// One consistent snapshot per scrape.
pub fn calculate(conn: &Connection) -> Result<CalculatedMetrics> {
    let mut metrics = CalculatedMetrics::default();

    (metrics.authorized_machines, metrics.unauthorized_machines, metrics.unreachable_machines) =
        conn.query_row(
            "SELECT COUNT(*) FILTER (WHERE authorized), \
                    COUNT(*) FILTER (WHERE NOT authorized), \
                    COUNT(*) FILTER (WHERE last_error IS NOT NULL) \
             FROM machine",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

    let mut stmt = conn.prepare(
        "SELECT prefix, addr_utilization, pd_utilization FROM subnet ORDER BY id",
    )?;
    metrics.subnets = stmt
        .query_map([], |row| {
            Ok(NetworkMetrics {
                label: row.get(0)?,
                addr_utilization: row.get(1)?,
                pd_utilization: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT name, addr_utilization, pd_utilization FROM shared_network ORDER BY id",
    )?;
    metrics.shared_networks = stmt
        .query_map([], |row| {
            Ok(NetworkMetrics {
                label: row.get(0)?,
                addr_utilization: row.get(1)?,
                pd_utilization: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(metrics)
}
