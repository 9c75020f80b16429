//! The reconciliation commit layer.
//!
//! Takes an agent-reported inventory and persists it idempotently in one
//! transaction: machine → apps → daemons → shared networks → subnets →
//! hosts, with join rows updated in place and orphans pruned at the end.
//! Two commits for the same machine are serialized by a per-machine lock;
//! commits for different machines run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use heron_common::addr::{canonical_prefix, Family};
use heron_keacfg::{KeaConfig, Reservation, SubnetCfg};
use heron_transport::rpc::{AccessPointReport, AppType};

use crate::store::host::HostIdentifier;
use crate::store::{app, host, machine, subnet, Db, Result};

/// A daemon as assembled by the pullers, possibly with its configuration.
#[derive(Debug, Clone)]
pub struct DaemonInventory {
    pub name: String,
    pub active: bool,
    pub config: Option<serde_json::Value>,
}

/// An app as assembled by the pullers. `daemons: None` means the daemon
/// list is unknown in this report and existing rows are left alone.
#[derive(Debug, Clone)]
pub struct AppInventory {
    pub app_type: AppType,
    pub access_points: Vec<AccessPointReport>,
    pub daemons: Option<Vec<DaemonInventory>>,
}

/// A full machine report.
#[derive(Debug, Clone)]
pub struct MachineInventory {
    pub hostname: Option<String>,
    pub agent_version: String,
    pub apps: Vec<AppInventory>,
}

#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub app_ids: Vec<i64>,
    /// Daemons whose configuration digest changed; review triggers.
    pub changed_daemons: Vec<i64>,
    pub deleted_apps: u64,
    pub deleted_subnets: u64,
}

/// Per-machine in-memory locks serializing commits so later reports
/// supersede earlier ones.
#[derive(Default)]
pub struct MachineLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl MachineLocks {
    pub fn new() -> Self {
        MachineLocks::default()
    }

    pub async fn lock(&self, machine_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(machine_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Commit one machine inventory. The caller holds the machine lock.
pub fn commit(db: &Db, machine_id: i64, inventory: &MachineInventory) -> Result<CommitOutcome> {
    db.with_tx(|conn| {
        let mut outcome = CommitOutcome::default();

        machine::update_state(
            conn,
            machine_id,
            inventory.hostname.as_deref(),
            &inventory.agent_version,
        )?;

        for app_inventory in &inventory.apps {
            let access_points: Vec<app::AccessPoint> = app_inventory
                .access_points
                .iter()
                .map(|point| app::AccessPoint {
                    app_id: 0,
                    kind: point.kind.as_str().to_string(),
                    address: point.address.clone(),
                    port: point.port,
                    key: point.key.clone(),
                    use_secure_protocol: point.use_secure_protocol,
                })
                .collect();
            let app_id = app::upsert_app(
                conn,
                machine_id,
                app_inventory.app_type.as_str(),
                &access_points,
            )?;
            outcome.app_ids.push(app_id);

            if let Some(daemons) = &app_inventory.daemons {
                for daemon in daemons {
                    let daemon_id =
                        app::upsert_daemon(conn, app_id, &daemon.name, daemon.active)?;
                    if let Some(config) = &daemon.config {
                        let changed = app::update_daemon_config(conn, daemon_id, config)?;
                        if changed {
                            outcome.changed_daemons.push(daemon_id);
                        }
                        commit_daemon_networks(conn, daemon_id, config)?;
                    }
                }
            }
        }

        outcome.deleted_apps = app::delete_unseen_apps(conn, machine_id, &outcome.app_ids)?;
        outcome.deleted_subnets = subnet::delete_orphaned_subnets(conn)?;
        subnet::delete_empty_shared_networks(conn)?;
        Ok(outcome)
    })
}

/// Commit the networks, subnets, and config-sourced hosts a daemon's
/// configuration declares. Runs inside the commit transaction.
fn commit_daemon_networks(
    conn: &rusqlite::Connection,
    daemon_id: i64,
    config: &serde_json::Value,
) -> Result<()> {
    let config = KeaConfig::from_value(config.clone());
    let Some(family) = config.family() else {
        // Only DHCP daemon configurations carry networks.
        return Ok(());
    };

    let mut seen_subnets = Vec::new();
    let mut seen_hosts = Vec::new();

    for network in config.shared_networks() {
        let network_id = subnet::upsert_shared_network(conn, &network.name, family)?;
        for subnet_cfg in &network.subnets {
            commit_subnet(
                conn,
                daemon_id,
                subnet_cfg,
                Some(network_id),
                family,
                &mut seen_subnets,
                &mut seen_hosts,
            )?;
        }
    }
    for subnet_cfg in config.top_level_subnets() {
        commit_subnet(
            conn,
            daemon_id,
            &subnet_cfg,
            None,
            family,
            &mut seen_subnets,
            &mut seen_hosts,
        )?;
    }

    subnet::prune_local_subnets(conn, daemon_id, &seen_subnets)?;
    host::prune_local_hosts(conn, daemon_id, host::SOURCE_CONFIG, &seen_hosts)?;
    Ok(())
}

fn commit_subnet(
    conn: &rusqlite::Connection,
    daemon_id: i64,
    subnet_cfg: &SubnetCfg,
    shared_network_id: Option<i64>,
    family: Family,
    seen_subnets: &mut Vec<i64>,
    seen_hosts: &mut Vec<i64>,
) -> Result<()> {
    let prefix = match canonical_prefix(&subnet_cfg.prefix) {
        Ok(prefix) => prefix,
        Err(e) => {
            tracing::warn!(prefix = %subnet_cfg.prefix, error = %e,
                "Skipping subnet with unparseable prefix");
            return Ok(());
        }
    };
    if Family::of(&prefix) != family {
        tracing::warn!(prefix = %prefix, "Skipping subnet with mismatched family");
        return Ok(());
    }

    let address_pools: Vec<(String, String)> = subnet_cfg
        .pools
        .iter()
        .map(|pool| (pool.lower.to_string(), pool.upper.to_string()))
        .collect();
    let prefix_pools: Vec<(String, u8)> = subnet_cfg
        .pd_pools
        .iter()
        .map(|pool| (pool.prefix.to_string(), pool.delegated_len))
        .collect();

    let subnet_id =
        subnet::upsert_subnet(conn, &prefix, shared_network_id, &address_pools, &prefix_pools)?;
    subnet::upsert_local_subnet(
        conn,
        subnet_id,
        daemon_id,
        subnet_cfg.local_id.unwrap_or(0),
    )?;
    seen_subnets.push(subnet_id);

    for reservation in &subnet_cfg.reservations {
        if let Some(host_id) =
            commit_reservation(conn, daemon_id, Some(subnet_id), reservation, host::SOURCE_CONFIG)?
        {
            seen_hosts.push(host_id);
        }
    }
    Ok(())
}

/// Commit one host reservation; shared by the config path and the
/// host_cmds puller (`data_source = api`).
pub fn commit_reservation(
    conn: &rusqlite::Connection,
    daemon_id: i64,
    subnet_id: Option<i64>,
    reservation: &Reservation,
    data_source: &str,
) -> Result<Option<i64>> {
    if reservation.identifiers.is_empty() {
        return Ok(None);
    }
    let identifiers: Vec<HostIdentifier> = reservation
        .identifiers
        .iter()
        .map(|(kind, value)| HostIdentifier::new(kind, value))
        .collect();
    let mut addresses = reservation.addresses.clone();
    addresses.extend(reservation.prefixes.iter().cloned());

    let host_id = host::upsert_host(
        conn,
        subnet_id,
        &identifiers,
        reservation.hostname.as_deref(),
        &addresses,
    )?;
    host::upsert_local_host(conn, host_id, daemon_id, data_source, &reservation.option_data)?;
    Ok(Some(host_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_transport::rpc::AccessPointKind;

    fn control_point(port: u16) -> AccessPointReport {
        AccessPointReport {
            kind: AccessPointKind::Control,
            address: "127.0.0.1".to_string(),
            port,
            key: None,
            use_secure_protocol: false,
        }
    }

    fn dhcp4_config() -> serde_json::Value {
        serde_json::json!({
            "Dhcp4": {
                "shared-networks": [
                    {
                        "name": "lily",
                        "subnet4": [
                            {
                                "id": 11,
                                "subnet": "192.0.2.0/24",
                                "pools": [ { "pool": "192.0.2.10 - 192.0.2.100" } ],
                                "reservations": [
                                    {
                                        "hw-address": "01:02:03:04:05:06",
                                        "ip-address": "192.0.2.5",
                                        "hostname": "frog"
                                    }
                                ]
                            }
                        ]
                    }
                ],
                "subnet4": [
                    { "id": 22, "subnet": "192.0.3.5/24" }
                ]
            }
        })
    }

    fn kea_inventory(config: serde_json::Value) -> MachineInventory {
        MachineInventory {
            hostname: Some("pond".to_string()),
            agent_version: "0.4.0".to_string(),
            apps: vec![AppInventory {
                app_type: AppType::Kea,
                access_points: vec![control_point(8000)],
                daemons: Some(vec![DaemonInventory {
                    name: "dhcp4".to_string(),
                    active: true,
                    config: Some(config),
                }]),
            }],
        }
    }

    fn setup() -> (Db, i64) {
        let db = Db::open_in_memory().unwrap();
        let m = machine::add(&db.connection(), "192.0.2.1", 8140, "fp").unwrap();
        (db, m.id)
    }

    #[test]
    fn commit_builds_the_full_tree() {
        let (db, machine_id) = setup();
        let outcome = commit(&db, machine_id, &kea_inventory(dhcp4_config())).unwrap();
        assert_eq!(outcome.app_ids.len(), 1);
        assert_eq!(outcome.changed_daemons.len(), 1);

        let conn = db.connection();
        let fetched = machine::get(&conn, machine_id).unwrap();
        assert_eq!(fetched.hostname.as_deref(), Some("pond"));

        let (subnets, total) = subnet::list_subnets(&conn, 0, 10).unwrap();
        assert_eq!(total, 2);
        // Prefixes were canonicalized on the way in.
        let prefixes: Vec<&str> = subnets.iter().map(|s| s.prefix.as_str()).collect();
        assert!(prefixes.contains(&"192.0.2.0/24"));
        assert!(prefixes.contains(&"192.0.3.0/24"));

        let in_network = subnets
            .iter()
            .find(|s| s.prefix == "192.0.2.0/24")
            .unwrap();
        assert!(in_network.shared_network_id.is_some());
        assert_eq!(in_network.local_subnets[0].local_subnet_id, 11);
        assert_eq!(in_network.address_pools.len(), 1);

        let hosts = host::hosts_of_subnet(&conn, in_network.id).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname.as_deref(), Some("frog"));
        assert_eq!(hosts[0].local_hosts[0].data_source, host::SOURCE_CONFIG);
    }

    #[test]
    fn commit_is_idempotent() {
        let (db, machine_id) = setup();
        let inventory = kea_inventory(dhcp4_config());
        commit(&db, machine_id, &inventory).unwrap();
        let second = commit(&db, machine_id, &inventory).unwrap();

        // Unchanged config: no review trigger, nothing pruned or added.
        assert!(second.changed_daemons.is_empty());
        assert_eq!(second.deleted_apps, 0);
        assert_eq!(second.deleted_subnets, 0);

        let conn = db.connection();
        let (_, subnet_total) = subnet::list_subnets(&conn, 0, 10).unwrap();
        assert_eq!(subnet_total, 2);
        let (hosts, host_total) = host::list_hosts(&conn, 0, 10).unwrap();
        assert_eq!(host_total, 1);
        assert_eq!(hosts[0].identifiers.len(), 1);
        assert_eq!(hosts[0].ip_reservations.len(), 1);
    }

    #[test]
    fn removed_subnet_is_pruned_with_its_hosts() {
        let (db, machine_id) = setup();
        commit(&db, machine_id, &kea_inventory(dhcp4_config())).unwrap();

        let shrunk = serde_json::json!({
            "Dhcp4": {
                "subnet4": [ { "id": 22, "subnet": "192.0.3.0/24" } ]
            }
        });
        let outcome = commit(&db, machine_id, &kea_inventory(shrunk)).unwrap();
        assert_eq!(outcome.deleted_subnets, 1);

        let conn = db.connection();
        let (subnets, total) = subnet::list_subnets(&conn, 0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(subnets[0].prefix, "192.0.3.0/24");
        let (_, host_total) = host::list_hosts(&conn, 0, 10).unwrap();
        assert_eq!(host_total, 0);
        // The shared network lost its last subnet and was pruned too.
        let (networks, _) = subnet::list_shared_networks(&conn, 0, 10).unwrap();
        assert!(networks.is_empty());
    }

    #[test]
    fn unseen_app_is_deleted() {
        let (db, machine_id) = setup();
        commit(&db, machine_id, &kea_inventory(dhcp4_config())).unwrap();

        let empty = MachineInventory {
            hostname: None,
            agent_version: "0.4.0".to_string(),
            apps: Vec::new(),
        };
        let outcome = commit(&db, machine_id, &empty).unwrap();
        assert_eq!(outcome.deleted_apps, 1);

        let conn = db.connection();
        let (apps, total) = app::list_apps(&conn, 0, 10, Some(machine_id), None).unwrap();
        assert!(apps.is_empty());
        assert_eq!(total, 0);
        // Daemons cascaded, so the subnets they served are orphaned.
        let (_, subnet_total) = subnet::list_subnets(&conn, 0, 10).unwrap();
        assert_eq!(subnet_total, 0);
    }

    #[test]
    fn monitored_flag_survives_recommit() {
        let (db, machine_id) = setup();
        let outcome = commit(&db, machine_id, &kea_inventory(dhcp4_config())).unwrap();
        let conn = db.connection();
        let daemons = app::daemons_of_app(&conn, outcome.app_ids[0]).unwrap();
        app::set_monitored(&conn, daemons[0].id, false).unwrap();
        drop(conn);

        commit(&db, machine_id, &kea_inventory(dhcp4_config())).unwrap();
        let conn = db.connection();
        let daemons = app::daemons_of_app(&conn, outcome.app_ids[0]).unwrap();
        assert!(!daemons[0].monitored);
    }

    #[tokio::test]
    async fn machine_locks_serialize_per_machine() {
        let locks = MachineLocks::new();
        let first = locks.lock(1).await;
        // A different machine is not blocked.
        let _other = locks.lock(2).await;
        // The same machine is blocked until the first guard drops.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), locks.lock(1))
                .await
                .is_err()
        );
        drop(first);
        let _reacquired = locks.lock(1).await;
    }
}
