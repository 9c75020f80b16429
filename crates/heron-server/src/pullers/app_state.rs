//! The app-state puller: fetch daemon status, versions, and
//! configurations for every app, commit the result, and trigger reviews
//! for daemons whose configuration changed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use heron_keacfg::KeaConfig;
use heron_transport::rpc::{AccessPointKind, AccessPointReport, AppType};

use crate::kea;
use crate::reconcile::{self, AppInventory, DaemonInventory, MachineInventory};
use crate::review::Trigger;
use crate::store::app::{self, App};
use crate::store::event::{Level, Relations};
use crate::store::machine::{self, Machine};

use super::PullerDeps;

/// Kea daemon names reachable through the Control Agent sockets.
const KEA_SERVICES: &[&str] = &["dhcp4", "dhcp6", "d2"];

/// Observed state of one daemon, applied after the commit.
#[derive(Debug, Default, Clone)]
struct DaemonObservation {
    version: Option<String>,
    uptime: Option<i64>,
    last_error: Option<String>,
}

pub async fn run(deps: Arc<PullerDeps>, cancel: CancellationToken) -> anyhow::Result<()> {
    let machines = machine::list_authorized(&deps.db.connection())?;
    for target in machines {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = refresh_machine_apps(&deps, &target).await {
            tracing::warn!(machine_id = target.id, error = %e, "App state refresh failed");
        }
    }
    Ok(())
}

async fn refresh_machine_apps(deps: &Arc<PullerDeps>, target: &Machine) -> anyhow::Result<()> {
    let (apps, _) = app::list_apps(&deps.db.connection(), 0, i64::MAX, Some(target.id), None)?;
    if apps.is_empty() {
        return Ok(());
    }

    let mut inventories = Vec::new();
    let mut observations: HashMap<(i64, String), DaemonObservation> = HashMap::new();

    for stored_app in &apps {
        let inventory = match stored_app.app_type.as_str() {
            app::APP_TYPE_KEA => {
                refresh_kea_app(deps, target, stored_app, &mut observations).await
            }
            app::APP_TYPE_BIND9 => {
                refresh_bind9_app(deps, target, stored_app, &mut observations).await
            }
            other => {
                tracing::warn!(app_id = stored_app.id, app_type = other, "Unknown app type");
                continue;
            }
        };
        inventories.push(inventory);
    }

    let machine_inventory = MachineInventory {
        hostname: target.hostname.clone(),
        agent_version: target.agent_version.clone().unwrap_or_default(),
        apps: inventories,
    };

    let outcome = {
        let _guard = deps.locks.lock(target.id).await;
        reconcile::commit(&deps.db, target.id, &machine_inventory)?
    };

    // Apply per-daemon observations now that the rows exist. Events are
    // collected and emitted after the connection guard drops.
    let mut pending_events: Vec<(String, String, Relations)> = Vec::new();
    {
        let conn = deps.db.connection();
        for app_id in &outcome.app_ids {
            for daemon in app::daemons_of_app(&conn, *app_id)? {
                if let Some(observation) = observations.get(&(*app_id, daemon.name.clone())) {
                    app::update_daemon_state(
                        &conn,
                        daemon.id,
                        observation.version.as_deref(),
                        observation.uptime,
                        observation.last_error.as_deref(),
                    )?;
                    if let Some(error) = &observation.last_error {
                        if daemon.last_error.as_deref() != Some(error.as_str()) {
                            pending_events.push((
                                format!("Daemon {} reports an error", daemon.name),
                                error.clone(),
                                Relations {
                                    machine_id: Some(target.id),
                                    app_id: Some(*app_id),
                                    daemon_id: Some(daemon.id),
                                    ..Default::default()
                                },
                            ));
                        }
                    }
                }
            }
        }
    }
    for (text, details, relations) in pending_events {
        let _ = deps.bus.emit(Level::Warn, &text, Some(&details), relations);
    }

    for daemon_id in outcome.changed_daemons {
        deps.review.trigger(daemon_id, Trigger::ConfigChange);
    }
    Ok(())
}

/// Query the Kea Control Agent and its daemons through the agent.
/// The observation map is keyed by `(app_id, daemon name)`.
async fn refresh_kea_app(
    deps: &Arc<PullerDeps>,
    target: &Machine,
    stored_app: &App,
    observations: &mut HashMap<(i64, String), DaemonObservation>,
) -> AppInventory {
    let access_points: Vec<AccessPointReport> = stored_app
        .access_points
        .iter()
        .map(|point| AccessPointReport {
            kind: if point.kind == app::ACCESS_POINT_STATISTICS {
                AccessPointKind::Statistics
            } else {
                AccessPointKind::Control
            },
            address: point.address.clone(),
            port: point.port,
            key: point.key.clone(),
            use_secure_protocol: point.use_secure_protocol,
        })
        .collect();
    let mut inventory = AppInventory {
        app_type: AppType::Kea,
        access_points,
        daemons: Some(Vec::new()),
    };
    let Some(control) = app::control_point(stored_app) else {
        return inventory;
    };
    let url = kea::control_url(control);

    // The Control Agent answers directly; its config lists the daemon
    // control sockets.
    let ca_payloads = vec![
        kea::command("version-get", None, None),
        kea::command("config-get", None, None),
    ];
    let responses = match deps
        .agents
        .forward_to_kea(&target.address, target.agent_port, &url, ca_payloads)
        .await
    {
        Ok(responses) => responses,
        Err(e) => {
            tracing::warn!(app_id = stored_app.id, error = %e,
                "Kea Control Agent is not answering");
            observations.insert(
                (stored_app.id, app::DAEMON_CA.to_string()),
                DaemonObservation {
                    last_error: Some(e.to_string()),
                    ..Default::default()
                },
            );
            inventory.daemons = Some(vec![DaemonInventory {
                name: app::DAEMON_CA.to_string(),
                active: false,
                config: None,
            }]);
            return inventory;
        }
    };

    let ca_version = responses
        .first()
        .and_then(kea_response_version);
    let ca_config = responses
        .get(1)
        .and_then(|value| kea::parse_response(value))
        .filter(|response| response.is_success())
        .and_then(|response| response.arguments);

    let mut daemons = vec![DaemonInventory {
        name: app::DAEMON_CA.to_string(),
        active: true,
        config: ca_config.clone(),
    }];
    observations.insert(
        (stored_app.id, app::DAEMON_CA.to_string()),
        DaemonObservation {
            version: ca_version,
            ..Default::default()
        },
    );

    for service in configured_services(ca_config.as_ref()) {
        let payloads = vec![
            kea::command("status-get", Some(&service), None),
            kea::command("version-get", Some(&service), None),
            kea::command("config-get", Some(&service), None),
        ];
        let responses = match deps
            .agents
            .forward_to_kea(&target.address, target.agent_port, &url, payloads)
            .await
        {
            Ok(responses) => responses,
            Err(e) => {
                daemons.push(DaemonInventory {
                    name: service.clone(),
                    active: false,
                    config: None,
                });
                observations.insert(
                    (stored_app.id, service.clone()),
                    DaemonObservation {
                        last_error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                continue;
            }
        };

        let status = responses.first().and_then(|value| kea::parse_response(value));
        let version = responses.get(1).and_then(kea_response_version);
        let config = responses
            .get(2)
            .and_then(|value| kea::parse_response(value))
            .filter(|response| response.is_success())
            .and_then(|response| response.arguments);

        let active = status.as_ref().is_some_and(|s| s.is_success());
        let uptime = status
            .as_ref()
            .and_then(|s| s.arguments.as_ref())
            .and_then(|arguments| arguments.get("uptime"))
            .and_then(Value::as_i64);
        let last_error = status.and_then(|s| if s.is_success() { None } else { s.text });

        daemons.push(DaemonInventory {
            name: service.clone(),
            active,
            config,
        });
        observations.insert(
            (stored_app.id, service),
            DaemonObservation {
                version,
                uptime,
                last_error,
            },
        );
    }

    inventory.daemons = Some(daemons);
    inventory
}

/// Query the named statistics channel for version and uptime.
async fn refresh_bind9_app(
    deps: &Arc<PullerDeps>,
    target: &Machine,
    stored_app: &App,
    observations: &mut HashMap<(i64, String), DaemonObservation>,
) -> AppInventory {
    let access_points: Vec<AccessPointReport> = stored_app
        .access_points
        .iter()
        .map(|point| AccessPointReport {
            kind: if point.kind == app::ACCESS_POINT_STATISTICS {
                AccessPointKind::Statistics
            } else {
                AccessPointKind::Control
            },
            address: point.address.clone(),
            port: point.port,
            key: point.key.clone(),
            use_secure_protocol: point.use_secure_protocol,
        })
        .collect();
    let mut inventory = AppInventory {
        app_type: AppType::Bind9,
        access_points,
        daemons: Some(vec![DaemonInventory {
            name: app::DAEMON_NAMED.to_string(),
            active: false,
            config: None,
        }]),
    };

    let Some(statistics) = stored_app
        .access_points
        .iter()
        .find(|point| point.kind == app::ACCESS_POINT_STATISTICS)
    else {
        return inventory;
    };
    let url = format!(
        "http://{}:{}/json/v1",
        statistics.address, statistics.port
    );

    match deps
        .agents
        .forward_to_named_stats(&target.address, target.agent_port, &url)
        .await
    {
        Ok(stats) => {
            let version = stats
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string);
            let uptime = named_uptime(&stats);
            inventory.daemons = Some(vec![DaemonInventory {
                name: app::DAEMON_NAMED.to_string(),
                active: true,
                config: None,
            }]);
            observations.insert(
                (stored_app.id, app::DAEMON_NAMED.to_string()),
                DaemonObservation {
                    version,
                    uptime,
                    last_error: None,
                },
            );
        }
        Err(e) => {
            observations.insert(
                (stored_app.id, app::DAEMON_NAMED.to_string()),
                DaemonObservation {
                    last_error: Some(e.to_string()),
                    ..Default::default()
                },
            );
        }
    }
    inventory
}

/// Daemons the Control Agent has sockets for, in a fixed order.
fn configured_services(ca_config: Option<&Value>) -> Vec<String> {
    let Some(config) = ca_config else {
        return Vec::new();
    };
    let kea_config = KeaConfig::from_value(config.clone());
    let Some(sockets) = kea_config.root().get("control-sockets") else {
        return Vec::new();
    };
    KEA_SERVICES
        .iter()
        .filter(|service| sockets.get(**service).is_some())
        .map(|service| service.to_string())
        .collect()
}

/// Version from a `version-get` answer: the `text` field carries it.
fn kea_response_version(value: &Value) -> Option<String> {
    let response = kea::parse_response(value)?;
    if !response.is_success() {
        return None;
    }
    response.text
}

/// Uptime in seconds from the named statistics JSON (`boot-time` vs
/// `current-time`).
fn named_uptime(stats: &Value) -> Option<i64> {
    let boot = stats.get("boot-time").and_then(Value::as_str)?;
    let current = stats.get("current-time").and_then(Value::as_str)?;
    let boot = chrono::DateTime::parse_from_rfc3339(boot).ok()?;
    let current = chrono::DateTime::parse_from_rfc3339(current).ok()?;
    Some((current - boot).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_services_follow_control_sockets() {
        let ca_config = serde_json::json!({
            "Control-agent": {
                "control-sockets": {
                    "dhcp4": { "socket-type": "unix" },
                    "d2": { "socket-type": "unix" }
                }
            }
        });
        assert_eq!(configured_services(Some(&ca_config)), vec!["dhcp4", "d2"]);
        assert!(configured_services(None).is_empty());
    }

    #[test]
    fn version_comes_from_the_text_field() {
        let answer = serde_json::json!([{ "result": 0, "text": "2.4.1" }]);
        assert_eq!(kea_response_version(&answer).as_deref(), Some("2.4.1"));
        let failed = serde_json::json!([{ "result": 1, "text": "boom" }]);
        assert_eq!(kea_response_version(&failed), None);
    }

    #[test]
    fn named_uptime_from_boot_and_current_time() {
        let stats = serde_json::json!({
            "boot-time": "2026-08-01T10:00:00Z",
            "current-time": "2026-08-01T12:30:00Z"
        });
        assert_eq!(named_uptime(&stats), Some(9000));
        assert_eq!(named_uptime(&serde_json::json!({})), None);
    }
}
