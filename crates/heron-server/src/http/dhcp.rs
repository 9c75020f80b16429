//! DHCP inventory resources: apps, subnets, shared networks, hosts, and
//! the lease search proxy.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use heron_common::addr::Family;

use crate::kea;
use crate::store::{app, host, machine, subnet};

use super::{ApiError, ApiState, ListPage, PageParams};

#[derive(Debug, Deserialize)]
pub struct AppFilter {
    pub machine: Option<i64>,
    #[serde(rename = "appType")]
    pub app_type: Option<String>,
}

pub async fn list_apps(
    State(state): State<ApiState>,
    Query(page): Query<PageParams>,
    Query(filter): Query<AppFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.connection();
    let (mut items, total) = app::list_apps(
        &conn,
        page.offset(),
        page.limit(),
        filter.machine,
        filter.app_type.as_deref(),
    )?;
    // Serve apps with their daemons inline.
    let mut enriched = Vec::with_capacity(items.len());
    for stored in items.drain(..) {
        let daemons = app::daemons_of_app(&conn, stored.id)?;
        enriched.push(serde_json::json!({
            "app": stored,
            "daemons": daemons,
        }));
    }
    Ok(Json(ListPage {
        items: enriched,
        total,
    }))
}

pub async fn get_app(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.connection();
    let stored = app::get_app(&conn, id)?;
    let daemons = app::daemons_of_app(&conn, id)?;
    let mut daemon_views = Vec::with_capacity(daemons.len());
    for daemon in daemons {
        let ha = app::get_ha_service(&conn, daemon.id)?;
        daemon_views.push(serde_json::json!({
            "daemon": daemon,
            "ha": ha,
        }));
    }
    Ok(Json(serde_json::json!({
        "app": stored,
        "daemons": daemon_views,
    })))
}

pub async fn list_subnets(
    State(state): State<ApiState>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (items, total) =
        subnet::list_subnets(&state.db.connection(), page.offset(), page.limit())?;
    Ok(Json(ListPage { items, total }))
}

pub async fn get_subnet(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(subnet::get_subnet(&state.db.connection(), id)?))
}

pub async fn list_shared_networks(
    State(state): State<ApiState>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (items, total) =
        subnet::list_shared_networks(&state.db.connection(), page.offset(), page.limit())?;
    Ok(Json(ListPage { items, total }))
}

pub async fn list_hosts(
    State(state): State<ApiState>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (items, total) = host::list_hosts(&state.db.connection(), page.offset(), page.limit())?;
    Ok(Json(ListPage { items, total }))
}

#[derive(Debug, Deserialize)]
pub struct LeaseSearchParams {
    /// A lease address to look up.
    pub text: String,
}

/// Search leases by address: the query is forwarded to every monitored
/// DHCP daemon with `lease4-get`/`lease6-get` until one answers.
pub async fn search_leases(
    State(state): State<ApiState>,
    Query(params): Query<LeaseSearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let address = params.text.trim();
    let parsed: std::net::IpAddr = address
        .parse()
        .map_err(|_| ApiError::invalid(format!("not a lease address: {address:?}")))?;
    let family = match parsed {
        std::net::IpAddr::V4(_) => Family::V4,
        std::net::IpAddr::V6(_) => Family::V6,
    };

    let daemons = app::monitored_dhcp_daemons(&state.db.connection())?;
    let mut items: Vec<Value> = Vec::new();
    for daemon in daemons {
        let wanted = match family {
            Family::V4 => app::DAEMON_DHCP4,
            Family::V6 => app::DAEMON_DHCP6,
        };
        if daemon.name != wanted {
            continue;
        }
        let conn_data = {
            let conn = state.db.connection();
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
        let Some((agent_address, agent_port, url)) = conn_data else {
            continue;
        };

        let command_name = match family {
            Family::V4 => "lease4-get",
            Family::V6 => "lease6-get",
        };
        let arguments = serde_json::json!({ "ip-address": address });
        let responses = match state
            .agents
            .forward_to_kea(
                &agent_address,
                agent_port,
                &url,
                vec![kea::command(command_name, Some(&daemon.name), Some(arguments))],
            )
            .await
        {
            Ok(responses) => responses,
            Err(e) => {
                tracing::debug!(daemon_id = daemon.id, error = %e, "Lease lookup failed");
                continue;
            }
        };
        if let Some(response) = responses.first().and_then(|value| kea::parse_response(value)) {
            if response.is_success() {
                if let Some(mut lease) = response.arguments.filter(Value::is_object) {
                    lease["daemon_id"] = serde_json::json!(daemon.id);
                    items.push(lease);
                }
            }
        }
    }

    let total = items.len() as i64;
    Ok(Json(ListPage { items, total }))
}
