//! Operational endpoints: puller statuses, settings, Prometheus metrics,
//! the OpenAPI document, and the generated agent install script.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::store::settings;

use super::{ApiError, ApiState, ListPage};

pub async fn list_pullers(State(state): State<ApiState>) -> impl IntoResponse {
    let items = state.pullers.statuses(&state.db);
    let total = items.len() as i64;
    Json(ListPage { items, total })
}

pub async fn get_puller(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .pullers
        .status_by_id(&state.db, &id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("puller {id}")))
}

pub async fn list_settings(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.connection();
    let mut items = Vec::new();
    for &(name, _) in settings::DEFAULT_INTERVALS {
        let value = settings::get(&conn, name)?;
        items.push(serde_json::json!({ "name": name, "value": value }));
    }
    let total = items.len() as i64;
    Ok(Json(ListPage { items, total }))
}

#[derive(Debug, Deserialize)]
pub struct SettingUpdate {
    pub name: String,
    pub value: String,
}

/// Interval changes take effect at the puller's next tick.
pub async fn set_setting(
    State(state): State<ApiState>,
    Json(update): Json<SettingUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    if update.value.parse::<i64>().is_err() {
        return Err(ApiError::invalid(format!(
            "setting {} expects an integer, got {:?}",
            update.name, update.value
        )));
    }
    settings::set(&state.db.connection(), &update.name, &update.value)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn metrics(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// A compact OpenAPI description of the stable resources.
pub async fn swagger() -> impl IntoResponse {
    Json(serde_json::json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Heron API",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/api/machines": { "get": {}, "post": {} },
            "/api/machines/{id}": { "get": {}, "put": {}, "delete": {} },
            "/api/apps": { "get": {} },
            "/api/subnets": { "get": {} },
            "/api/shared-networks": { "get": {} },
            "/api/hosts": { "get": {} },
            "/api/leases": { "get": {} },
            "/api/events": { "get": {} },
            "/api/sse": { "get": {} },
            "/api/daemons/{id}/config-checkers": { "get": {}, "put": {} },
            "/api/daemons/{id}/config-reports": { "get": {} },
            "/api/pullers": { "get": {} },
            "/metrics": { "get": {} },
        },
    }))
}

/// Directory the packaged agent artifacts are served from.
const PKGS_DIR: &str = "assets/pkgs";

/// Generate the agent install script: detect the package manager from
/// the OS release file, pick a matching artifact, install, and register.
pub async fn install_script(State(_state): State<ApiState>) -> impl IntoResponse {
    let artifacts: Vec<String> = std::fs::read_dir(PKGS_DIR)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| {
                    name.ends_with(".deb") || name.ends_with(".rpm") || name.ends_with(".apk")
                })
                .collect()
        })
        .unwrap_or_default();

    let script = render_install_script(&artifacts);
    (
        [(header::CONTENT_TYPE, "text/x-shellscript")],
        script,
    )
}

fn render_install_script(artifacts: &[String]) -> String {
    let deb = artifacts.iter().find(|name| name.ends_with(".deb"));
    let rpm = artifacts.iter().find(|name| name.ends_with(".rpm"));
    let apk = artifacts.iter().find(|name| name.ends_with(".apk"));

    let mut script = String::from(
        "#!/bin/sh\n\
         # Heron agent installer, generated by the server.\n\
         set -e\n\
         \n\
         SERVER_URL=\"${HERON_SERVER_URL:-$1}\"\n\
         if [ -z \"$SERVER_URL\" ]; then\n\
         \techo \"usage: $0 <server-url>\" >&2\n\
         \texit 1\n\
         fi\n\
         \n\
         . /etc/os-release\n\
         case \"$ID $ID_LIKE\" in\n",
    );

    let mut case_arm = |pattern: &str, artifact: Option<&&String>, install: &str| {
        match artifact {
            Some(name) => script.push_str(&format!(
                "{pattern})\n\
                 \tPKG=\"{name}\"\n\
                 \tcurl -fsSL -o \"/tmp/$PKG\" \"$SERVER_URL/assets/pkgs/$PKG\"\n\
                 \t{install} \"/tmp/$PKG\"\n\
                 \t;;\n"
            )),
            None => script.push_str(&format!(
                "{pattern})\n\
                 \techo \"no package published for this OS\" >&2\n\
                 \texit 1\n\
                 \t;;\n"
            )),
        }
    };
    case_arm("*debian*|*ubuntu*", deb.as_ref(), "dpkg -i");
    case_arm("*rhel*|*fedora*|*centos*", rpm.as_ref(), "rpm -U");
    case_arm("*alpine*", apk.as_ref(), "apk add --allow-untrusted");
    script.push_str(
        "*)\n\
         \techo \"unsupported OS: $ID\" >&2\n\
         \texit 1\n\
         \t;;\n\
         esac\n\
         \n\
         systemctl enable --now heron-agent 2>/dev/null || true\n\
         heron-agent register -u \"$SERVER_URL\"\n",
    );
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::{get_json, test_state};

    #[tokio::test]
    async fn puller_listing_and_lookup() {
        let state = test_state();
        let (status, body) = get_json(state.clone(), "/api/pullers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 6);

        let (status, body) =
            get_json(state.clone(), "/api/pullers/kea_stats_puller_interval").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "kea-stats");

        let (status, _) = get_json(state, "/api/pullers/frogs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition_text() {
        let state = test_state();
        let (status, _) = get_json(state.clone(), "/api/machines").await;
        assert_eq!(status, StatusCode::OK);

        use tower::ServiceExt;
        let response = crate::http::router(state)
            .oneshot(
                axum::http::Request::get("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("heron_server_authorized_machines_total"));
    }

    #[tokio::test]
    async fn swagger_document_lists_stable_resources() {
        let state = test_state();
        let (status, body) = get_json(state, "/swagger.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/api/machines"].is_object());
        assert!(body["paths"]["/api/sse"].is_object());
    }

    #[test]
    fn install_script_selects_by_os_and_lists_artifacts() {
        let script = render_install_script(&[
            "heron-agent_0.4.0_amd64.deb".to_string(),
            "heron-agent-0.4.0.x86_64.rpm".to_string(),
        ]);
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("heron-agent_0.4.0_amd64.deb"));
        assert!(script.contains("dpkg -i"));
        assert!(script.contains("rpm -U"));
        // No apk artifact published: the alpine arm fails loudly.
        assert!(script.contains("no package published"));
        assert!(script.contains("heron-agent register -u"));
    }
}
