//! The ha-status puller: refresh the High-Availability state of every
//! DHCP daemon running the HA hook library.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use heron_keacfg::KeaConfig;

use crate::kea;
use crate::store::event::{Level, Relations};
use crate::store::{app, machine};

use super::PullerDeps;

pub async fn run(deps: Arc<PullerDeps>, cancel: CancellationToken) -> anyhow::Result<()> {
    let daemons = app::monitored_dhcp_daemons(&deps.db.connection())?;
    for daemon in daemons {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let has_ha = daemon
            .config
            .clone()
            .map(KeaConfig::from_value)
            .is_some_and(|config| config.has_hook_library("libdhcp_ha"));
        if !has_ha {
            continue;
        }
        if let Err(e) = pull_ha_state(&deps, &daemon).await {
            tracing::warn!(daemon_id = daemon.id, error = %e, "HA status pull failed");
        }
    }
    Ok(())
}

async fn pull_ha_state(deps: &Arc<PullerDeps>, daemon: &app::Daemon) -> anyhow::Result<()> {
    let conn_data = {
        let conn = deps.db.connection();
        let stored_app = app::get_app(&conn, daemon.app_id)?;
        let target = machine::get(&conn, stored_app.machine_id)?;
        app::control_point(&stored_app).map(|point| {
            (
                target.address.clone(),
                target.agent_port,
                kea::control_url(point),
                stored_app.machine_id,
            )
        })
    };
    let Some((address, agent_port, url, machine_id)) = conn_data else {
        return Ok(());
    };

    let responses = deps
        .agents
        .forward_to_kea(
            &address,
            agent_port,
            &url,
            vec![kea::command("status-get", Some(&daemon.name), None)],
        )
        .await?;
    let Some(response) = responses.first().and_then(|value| kea::parse_response(value)) else {
        anyhow::bail!("malformed status-get answer");
    };
    if !response.is_success() {
        anyhow::bail!("status-get failed: {}", response.text.unwrap_or_default());
    }
    let Some((local_state, partner_state)) = response
        .arguments
        .as_ref()
        .and_then(kea::parse_ha_state)
    else {
        return Ok(());
    };

    let previous_state = {
        let conn = deps.db.connection();
        let previous = app::get_ha_service(&conn, daemon.id)?;
        app::update_ha_service(
            &conn,
            daemon.id,
            Some(&local_state),
            partner_state.as_deref(),
        )?;
        previous.and_then(|service| service.ha_state)
    };
    if previous_state.as_deref() != Some(local_state.as_str()) {
        let _ = deps.bus.emit(
            Level::Warn,
            &format!(
                "HA state of {} changed from {} to {}",
                daemon.name,
                previous_state.as_deref().unwrap_or("unknown"),
                local_state
            ),
            None,
            Relations {
                machine_id: Some(machine_id),
                app_id: Some(daemon.app_id),
                daemon_id: Some(daemon.id),
                ..Default::default()
            },
        );
    }
    Ok(())
}
