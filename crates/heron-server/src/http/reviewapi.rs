//! Daemon and config-review endpoints: monitored toggles, checker
//! scopes, review reports, and manual review triggers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::review::{self, checkers, Trigger};
use crate::store::review::CheckerState;
use crate::store::{app, review as review_store};

use super::{ApiError, ApiState, ListPage};

#[derive(Debug, Deserialize)]
pub struct DaemonUpdate {
    pub monitored: bool,
}

pub async fn update_daemon(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(update): Json<DaemonUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    app::set_monitored(&state.db.connection(), id, update.monitored)?;
    Ok(Json(app::get_daemon(&state.db.connection(), id)?))
}

/// Checker states for one daemon: the daemon's own tri-state plus the
/// resolved effective state.
pub async fn daemon_checkers(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.connection();
    app::get_daemon(&conn, id)?;

    let mut items = Vec::new();
    for &(name, _) in checkers::registry() {
        let own = review_store::daemon_checker_own_state(&conn, id, name)?;
        let effective = review_store::checker_enabled_for_daemon(&conn, id, name)?;
        items.push(serde_json::json!({
            "name": name,
            "state": own,
            "enabled": effective,
        }));
    }
    let total = items.len() as i64;
    Ok(Json(ListPage { items, total }))
}

#[derive(Debug, Deserialize)]
pub struct CheckerUpdate {
    pub name: String,
    pub state: CheckerState,
}

pub async fn set_daemon_checker(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(update): Json<CheckerUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let known = checkers::registry()
        .iter()
        .any(|(name, _)| *name == update.name);
    if !known {
        return Err(ApiError::not_found(format!(
            "unknown checker: {}",
            update.name
        )));
    }
    let conn = state.db.connection();
    app::get_daemon(&conn, id)?;
    review_store::set_daemon_checker(&conn, id, &update.name, update.state)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn global_checkers(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.connection();
    let mut items = Vec::new();
    for &(name, _) in checkers::registry() {
        let enabled = review_store::global_checker_enabled(&conn, name)?;
        items.push(serde_json::json!({
            "name": name,
            "enabled": enabled,
        }));
    }
    let total = items.len() as i64;
    Ok(Json(ListPage { items, total }))
}

#[derive(Debug, Deserialize)]
pub struct GlobalCheckerUpdate {
    pub name: String,
    pub enabled: bool,
}

pub async fn set_global_checker(
    State(state): State<ApiState>,
    Json(update): Json<GlobalCheckerUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let known = checkers::registry()
        .iter()
        .any(|(name, _)| *name == update.name);
    if !known {
        return Err(ApiError::not_found(format!(
            "unknown checker: {}",
            update.name
        )));
    }
    review_store::set_global_checker(&state.db.connection(), &update.name, update.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ReportFilter {
    #[serde(default)]
    pub issues: bool,
}

/// Reports of the last review run, with `{daemon}` rendered.
pub async fn daemon_reports(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(filter): Query<ReportFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.connection();
    let daemon = app::get_daemon(&conn, id)?;
    let reports = review_store::list_reports(&conn, id, filter.issues)?;
    let review_record = review_store::get_review(&conn, id)?;

    let items: Vec<serde_json::Value> = reports
        .into_iter()
        .map(|report| {
            let content = report
                .content
                .as_deref()
                .map(|content| review::render_content(content, &daemon.name));
            serde_json::json!({
                "id": report.id,
                "created_at": report.created_at,
                "checker": report.checker_name,
                "content": content,
                "daemon_ids": report.ref_daemon_ids,
            })
        })
        .collect();
    let total = items.len() as i64;
    Ok(Json(serde_json::json!({
        "items": items,
        "total": total,
        "review": review_record,
    })))
}

/// Manual review trigger; the run is asynchronous.
pub async fn trigger_review(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    app::get_daemon(&state.db.connection(), id)?;
    state.review.trigger(id, Trigger::Manual);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::router;
    use crate::http::tests::{get_json, test_state};
    use crate::store::machine;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn seed_daemon(state: &ApiState) -> i64 {
        let conn = state.db.connection();
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
        app::update_daemon_config(&conn, daemon_id, &serde_json::json!({"Dhcp4": {}})).unwrap();
        daemon_id
    }

    #[tokio::test]
    async fn checker_listing_resolves_effective_state() {
        let state = test_state();
        let daemon_id = seed_daemon(&state);
        review_store::set_global_checker(&state.db.connection(), "subnet_dispensable", false)
            .unwrap();

        let (status, body) =
            get_json(state, &format!("/api/daemons/{daemon_id}/config-checkers")).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        let dispensable = items
            .iter()
            .find(|item| item["name"] == "subnet_dispensable")
            .unwrap();
        assert_eq!(dispensable["state"], "inherit");
        assert_eq!(dispensable["enabled"], false);
        let stat_cmds = items
            .iter()
            .find(|item| item["name"] == "stat_cmds_presence")
            .unwrap();
        assert_eq!(stat_cmds["enabled"], true);
    }

    #[tokio::test]
    async fn setting_unknown_checker_is_rejected() {
        let state = test_state();
        let daemon_id = seed_daemon(&state);
        let response = router(state)
            .oneshot(
                Request::put(format!("/api/daemons/{daemon_id}/config-checkers"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"name": "imaginary", "state": "disabled"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_trigger_produces_reports() {
        let state = test_state();
        let daemon_id = seed_daemon(&state);

        let response = router(state.clone())
            .oneshot(
                Request::post(format!("/api/daemons/{daemon_id}/config-review"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut body = serde_json::Value::Null;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let (_, fetched) = get_json(
                state.clone(),
                &format!("/api/daemons/{daemon_id}/config-reports?issues=true"),
            )
            .await;
            if fetched["total"].as_i64().unwrap_or(0) > 0 {
                body = fetched;
                break;
            }
        }
        let items = body["items"].as_array().unwrap();
        let stat_cmds = items
            .iter()
            .find(|item| item["checker"] == "stat_cmds_presence")
            .unwrap();
        // The {daemon} placeholder was rendered with the daemon name.
        let content = stat_cmds["content"].as_str().unwrap();
        assert!(content.contains("dhcp4"));
        assert!(!content.contains("{daemon}"));
    }
}
