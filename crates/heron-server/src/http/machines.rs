//! Machine resources: registration, authorization, listing, deletion,
//! on-demand ping, and remote log tailing.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use heron_common::addr::canonicalize_ip;
use heron_common::error::ErrorCode;
use heron_transport::material::sha256_hex;
use heron_transport::rpc::{RegistrationRequest, RegistrationResponse};

use crate::certs;
use crate::store::event::{Level, Relations};
use crate::store::machine;

use super::{ApiError, ApiState, ListPage, PageParams};

#[derive(Debug, Deserialize)]
pub struct MachineFilter {
    pub authorized: Option<bool>,
}

pub async fn list(
    State(state): State<ApiState>,
    Query(page): Query<PageParams>,
    Query(filter): Query<MachineFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let (items, total) = machine::list(
        &state.db.connection(),
        page.offset(),
        page.limit(),
        filter.authorized,
    )?;
    Ok(Json(ListPage { items, total }))
}

pub async fn get_one(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(machine::get(&state.db.connection(), id)?))
}

/// Agent enrollment. The machine appears pending until an administrator
/// authorizes it; re-registration with the same token is idempotent, a
/// different token for a claimed `(address, port)` is a conflict.
pub async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegistrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_address(&request.address)?;
    if request.token.is_empty() {
        return Err(ApiError::invalid("the agent token must not be empty"));
    }
    let token_fingerprint = sha256_hex(request.token.as_bytes());

    let registered = {
        let conn = state.db.connection();
        match machine::get_by_address(&conn, &address, request.agent_port)? {
            Some(existing) => {
                if existing.agent_token_fingerprint.as_deref()
                    != Some(token_fingerprint.as_str())
                {
                    return Err(ApiError::new(
                        ErrorCode::Conflict,
                        format!(
                            "machine {address}:{} is already claimed by another agent",
                            request.agent_port
                        ),
                    ));
                }
                existing
            }
            None => {
                let added = machine::add(&conn, &address, request.agent_port, &token_fingerprint)?;
                tracing::info!(machine_id = added.id, address = %address,
                    "New machine registered, pending authorization");
                added
            }
        }
    };

    let (cert_pem, ca_cert_pem, server_cert_fingerprint) =
        certs::sign_agent_csr(&state.db, &request.csr_pem)?;

    let _ = state.bus.emit(
        Level::Info,
        &format!("Agent on {address} registered"),
        None,
        Relations {
            machine_id: Some(registered.id),
            ..Default::default()
        },
    );

    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            machine_id: registered.id,
            authorized: registered.authorized,
            cert_pem,
            ca_cert_pem,
            server_cert_fingerprint,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct MachineUpdate {
    pub authorized: bool,
}

pub async fn update(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(update): Json<MachineUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = machine::set_authorized(&state.db.connection(), id, update.authorized)?;
    let _ = state.bus.emit(
        Level::Info,
        &format!(
            "Machine {} is now {}",
            updated.address,
            if updated.authorized {
                "authorized"
            } else {
                "pending"
            }
        ),
        None,
        Relations {
            machine_id: Some(id),
            ..Default::default()
        },
    );
    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let target = machine::get(&state.db.connection(), id)?;
    machine::delete(&state.db.connection(), id)?;
    let _ = state.bus.emit(
        Level::Warn,
        &format!("Machine {} was removed", target.address),
        None,
        Relations::default(),
    );
    Ok(StatusCode::NO_CONTENT)
}

/// On-demand reachability probe.
pub async fn ping(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let target = machine::get(&state.db.connection(), id)?;
    match state.agents.ping(&target.address, target.agent_port).await {
        Ok(()) => {
            machine::set_last_error(&state.db.connection(), id, None)?;
            Ok(Json(serde_json::json!({ "reachable": true })))
        }
        Err(e) => {
            machine::set_last_error(&state.db.connection(), id, Some(&e.to_string()))?;
            Ok(Json(serde_json::json!({
                "reachable": false,
                "error": e.to_string(),
            })))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogTailParams {
    pub path: String,
    pub offset: Option<u64>,
    #[serde(default = "default_tail_lines")]
    pub lines: usize,
}

fn default_tail_lines() -> usize {
    200
}

/// Tail a text file on the machine through the agent.
pub async fn log_tail(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(params): Query<LogTailParams>,
) -> Result<impl IntoResponse, ApiError> {
    let target = machine::get(&state.db.connection(), id)?;
    let (lines, offset) = state
        .agents
        .tail_text_file(
            &target.address,
            target.agent_port,
            &params.path,
            params.offset,
            params.lines,
        )
        .await
        .map_err(|e| {
            ApiError::new(
                if e.is_unreachable() {
                    ErrorCode::Unreachable
                } else {
                    ErrorCode::Internal
                },
                e.to_string(),
            )
        })?;
    Ok(Json(serde_json::json!({ "lines": lines, "offset": offset })))
}

/// Accept a literal IP in canonical form, or a plain hostname.
fn normalize_address(address: &str) -> Result<String, ApiError> {
    if let Ok(canonical) = canonicalize_ip(address) {
        return Ok(canonical);
    }
    let hostname_like = !address.is_empty()
        && !address.starts_with('-')
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if hostname_like {
        Ok(address.to_lowercase())
    } else {
        Err(ApiError::invalid(format!(
            "not a valid machine address: {address:?}"
        )))
    }
}
