//! The machine-state puller: refresh reachability and the app inventory
//! of every authorized machine. Machines are visited in parallel; each
//! commit holds its machine lock.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use heron_transport::rpc::StateReport;

use crate::reconcile::{self, AppInventory, MachineInventory};
use crate::store::event::{Level, Relations};
use crate::store::machine::{self, Machine};

use super::PullerDeps;

pub async fn run(deps: Arc<PullerDeps>, cancel: CancellationToken) -> anyhow::Result<()> {
    let machines = machine::list_authorized(&deps.db.connection())?;

    let mut visits = JoinSet::new();
    for target in machines {
        let deps = deps.clone();
        let cancel = cancel.clone();
        visits.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = refresh_machine(deps, target) => {}
            }
        });
    }
    while visits.join_next().await.is_some() {}
    Ok(())
}

async fn refresh_machine(deps: Arc<PullerDeps>, target: Machine) {
    let was_reachable = target.last_error.is_none();
    match deps.agents.get_state(&target.address, target.agent_port).await {
        Ok(state) => {
            let _guard = deps.locks.lock(target.id).await;
            if let Err(e) = commit_state(&deps, target.id, &state) {
                tracing::warn!(machine_id = target.id, error = %e,
                    "Machine state commit failed");
            } else if !was_reachable {
                let _ = deps.bus.emit(
                    Level::Info,
                    &format!("Machine {} is reachable again", target.address),
                    None,
                    Relations {
                        machine_id: Some(target.id),
                        ..Default::default()
                    },
                );
            }
        }
        Err(e) => {
            let message = e.to_string();
            let _ = machine::set_last_error(
                &deps.db.connection(),
                target.id,
                Some(&message),
            );
            if was_reachable {
                let _ = deps.bus.emit(
                    Level::Warn,
                    &format!("Cannot reach the agent on {}", target.address),
                    Some(&message),
                    Relations {
                        machine_id: Some(target.id),
                        ..Default::default()
                    },
                );
            }
        }
    }
}

fn commit_state(
    deps: &PullerDeps,
    machine_id: i64,
    state: &StateReport,
) -> crate::store::Result<()> {
    // Daemon details arrive via the app-state puller; `None` leaves the
    // stored daemons untouched.
    let inventory = MachineInventory {
        hostname: state.hostname.clone(),
        agent_version: state.agent_version.clone(),
        apps: state
            .apps
            .iter()
            .map(|report| AppInventory {
                app_type: report.app_type,
                access_points: report.access_points.clone(),
                daemons: None,
            })
            .collect(),
    };
    reconcile::commit(&deps.db, machine_id, &inventory)?;
    Ok(())
}
