//! The kea-hosts puller: page host reservations out of daemons running
//! the host_cmds hook library and commit them with the `api` source.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use heron_keacfg::{KeaConfig, Reservation};

use crate::kea;
use crate::reconcile;
use crate::store::{app, host, machine, subnet as subnet_store};

use super::PullerDeps;

/// Page size for `reservation-get-page`.
const PAGE_LIMIT: i64 = 100;

pub async fn run(deps: Arc<PullerDeps>, cancel: CancellationToken) -> anyhow::Result<()> {
    let daemons = app::monitored_dhcp_daemons(&deps.db.connection())?;
    for daemon in daemons {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let has_host_cmds = daemon
            .config
            .clone()
            .map(KeaConfig::from_value)
            .is_some_and(|config| config.has_hook_library("libdhcp_host_cmds"));
        if !has_host_cmds {
            continue;
        }
        if let Err(e) = pull_daemon_hosts(&deps, &daemon).await {
            tracing::warn!(daemon_id = daemon.id, error = %e, "Host reservation pull failed");
        }
    }
    Ok(())
}

async fn pull_daemon_hosts(
    deps: &Arc<PullerDeps>,
    daemon: &app::Daemon,
) -> anyhow::Result<()> {
    let conn_data = {
        let conn = deps.db.connection();
        let stored_app = app::get_app(&conn, daemon.app_id)?;
        let target = machine::get(&conn, stored_app.machine_id)?;
        app::control_point(&stored_app).map(|point| {
            (
                target.address.clone(),
                target.agent_port,
                kea::control_url(point),
            )
        })
    };
    let Some((address, agent_port, url)) = conn_data else {
        return Ok(());
    };

    let mut seen_hosts: Vec<i64> = Vec::new();
    let mut from: Option<i64> = None;
    let mut source_index: Option<i64> = None;

    loop {
        let mut arguments = serde_json::json!({ "limit": PAGE_LIMIT });
        if let Some(from) = from {
            arguments["from"] = serde_json::json!(from);
        }
        if let Some(source_index) = source_index {
            arguments["source-index"] = serde_json::json!(source_index);
        }
        let responses = deps
            .agents
            .forward_to_kea(
                &address,
                agent_port,
                &url,
                vec![kea::command(
                    "reservation-get-page",
                    Some(&daemon.name),
                    Some(arguments),
                )],
            )
            .await?;
        let Some(response) = responses.first().and_then(|value| kea::parse_response(value))
        else {
            anyhow::bail!("malformed reservation-get-page answer");
        };
        if response.result == kea::RESULT_EMPTY {
            break;
        }
        if !response.is_success() {
            anyhow::bail!(
                "reservation-get-page failed: {}",
                response.text.unwrap_or_default()
            );
        }
        let Some(arguments) = response.arguments else {
            break;
        };
        let hosts = arguments
            .get("hosts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if hosts.is_empty() {
            break;
        }

        commit_page(deps, daemon.id, &hosts, &mut seen_hosts)?;

        if (hosts.len() as i64) < PAGE_LIMIT {
            break;
        }
        let next = arguments.get("next");
        from = next
            .and_then(|next| next.get("from"))
            .and_then(Value::as_i64);
        source_index = next
            .and_then(|next| next.get("source-index"))
            .and_then(Value::as_i64);
        if from.is_none() {
            break;
        }
    }

    host::prune_local_hosts(
        &deps.db.connection(),
        daemon.id,
        host::SOURCE_API,
        &seen_hosts,
    )?;
    Ok(())
}

fn commit_page(
    deps: &Arc<PullerDeps>,
    daemon_id: i64,
    hosts: &[Value],
    seen_hosts: &mut Vec<i64>,
) -> crate::store::Result<()> {
    deps.db.with_tx(|conn| {
        for entry in hosts {
            let reservation = Reservation::from_value(entry);
            // Local subnet id 0 marks a global reservation.
            let subnet_id = match entry.get("subnet-id").and_then(Value::as_i64) {
                Some(0) | None => None,
                Some(local_id) => {
                    match subnet_store::subnet_id_by_local_id(conn, daemon_id, local_id)? {
                        Some(subnet_id) => Some(subnet_id),
                        None => {
                            tracing::debug!(daemon_id, local_id,
                                "Reservation for an unknown local subnet");
                            continue;
                        }
                    }
                }
            };
            if let Some(host_id) = reconcile::commit_reservation(
                conn,
                daemon_id,
                subnet_id,
                &reservation,
                host::SOURCE_API,
            )? {
                seen_hosts.push(host_id);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pullers::tests::test_deps;

    #[test]
    fn page_commit_maps_local_subnets_and_sources() {
        let deps = test_deps();
        let (daemon_id, subnet_id) = {
            let conn = deps.db.connection();
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
            let subnet_id =
                subnet_store::upsert_subnet(&conn, "192.0.2.0/24", None, &[], &[]).unwrap();
            subnet_store::upsert_local_subnet(&conn, subnet_id, daemon_id, 42).unwrap();
            (daemon_id, subnet_id)
        };

        let page = vec![
            serde_json::json!({
                "subnet-id": 42,
                "hw-address": "01:02:03:04:05:06",
                "ip-address": "192.0.2.9"
            }),
            serde_json::json!({
                "subnet-id": 0,
                "duid": "0a:0b",
                "ip-address": "192.0.5.1"
            }),
        ];
        let mut seen = Vec::new();
        commit_page(&deps, daemon_id, &page, &mut seen).unwrap();
        assert_eq!(seen.len(), 2);

        let conn = deps.db.connection();
        let in_subnet = host::hosts_of_subnet(&conn, subnet_id).unwrap();
        assert_eq!(in_subnet.len(), 1);
        assert_eq!(in_subnet[0].local_hosts[0].data_source, host::SOURCE_API);

        let (all, _) = host::list_hosts(&conn, 0, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|stored| stored.subnet_id.is_none()));
    }
}
