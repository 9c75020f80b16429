//! The kea-stats puller: pull per-subnet lease counters from every
//! monitored DHCP daemon, store them on the local subnets, and fold the
//! result into subnet, shared-network, and fleet-wide utilization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use heron_common::stats::SubnetStats;

use crate::kea;
use crate::store::{app, machine, statistic, subnet as subnet_store};
use crate::utilization::{per_mille, UtilizationCalculator};

use super::PullerDeps;

pub async fn run(deps: Arc<PullerDeps>, cancel: CancellationToken) -> anyhow::Result<()> {
    let daemons = app::monitored_dhcp_daemons(&deps.db.connection())?;
    for daemon in daemons {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = pull_daemon_stats(&deps, &daemon).await {
            tracing::warn!(daemon_id = daemon.id, error = %e, "Statistics pull failed");
        }
    }

    recalculate_utilization(&deps)?;
    Ok(())
}

async fn pull_daemon_stats(
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

    let command_name = if daemon.name == app::DAEMON_DHCP6 {
        "stat-lease6-get"
    } else {
        "stat-lease4-get"
    };
    let responses = deps
        .agents
        .forward_to_kea(
            &address,
            agent_port,
            &url,
            vec![kea::command(command_name, Some(&daemon.name), None)],
        )
        .await?;
    let Some(response) = responses.first().and_then(|value| kea::parse_response(value)) else {
        anyhow::bail!("malformed {command_name} answer");
    };
    if !response.is_success() {
        anyhow::bail!(
            "{command_name} failed: {}",
            response.text.unwrap_or_default()
        );
    }
    let Some(arguments) = response.arguments else {
        return Ok(());
    };

    // Group the result-set rows by daemon-local subnet id.
    let mut per_subnet: HashMap<i64, SubnetStats> = HashMap::new();
    for (local_subnet_id, name, value) in kea::parse_stat_result_set(&arguments) {
        per_subnet
            .entry(local_subnet_id)
            .or_default()
            .insert(name, value);
    }

    let conn = deps.db.connection();
    for (local_subnet_id, stats) in per_subnet {
        match subnet_store::subnet_id_by_local_id(&conn, daemon.id, local_subnet_id)? {
            Some(subnet_id) => {
                subnet_store::update_local_subnet_stats(&conn, subnet_id, daemon.id, &stats)?;
            }
            None => {
                tracing::debug!(daemon_id = daemon.id, local_subnet_id,
                    "Statistics for an unknown local subnet");
            }
        }
    }
    Ok(())
}

/// Fold the stored statistics into utilization figures in one pass.
fn recalculate_utilization(deps: &Arc<PullerDeps>) -> anyhow::Result<()> {
    let conn = deps.db.connection();
    let (subnets, _) = subnet_store::list_subnets(&conn, 0, i64::MAX)?;

    let mut calculator = UtilizationCalculator::new();
    for stored_subnet in &subnets {
        let lease_stats = calculator.add(stored_subnet);
        subnet_store::update_subnet_utilization(
            &conn,
            stored_subnet.id,
            per_mille(lease_stats.address_utilization()),
            per_mille(lease_stats.pd_utilization()),
            &lease_stats.stats(),
        )?;
    }

    for (network_id, network_stats) in &calculator.shared_networks {
        subnet_store::update_shared_network_utilization(
            &conn,
            *network_id,
            per_mille(network_stats.address_utilization()),
            per_mille(network_stats.pd_utilization()),
            &network_stats.stats(),
        )?;
    }

    for (name, value) in calculator.global.counters() {
        let rendered = if value.is_nan() {
            "-1".to_string()
        } else {
            format!("{}", value.round() as i128)
        };
        statistic::set(&conn, name, &rendered)?;
    }
    Ok(())
}
