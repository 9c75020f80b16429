//! The REST API.
//!
//! JSON over HTTP with `{offset, limit}` paging and `{items, total}`
//! list envelopes. Routes are grouped per domain; the binary mounts the
//! router and serves it with graceful shutdown.

mod dhcp;
mod eventsapi;
mod machines;
mod misc;
mod reviewapi;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use heron_common::error::ErrorCode;

use crate::agentcomm::AgentClients;
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use crate::puller::PullerRegistry;
use crate::reconcile::MachineLocks;
use crate::review::ReviewDispatcher;
use crate::store::{Db, StoreError};

/// Shared state of all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub bus: Arc<EventBus>,
    pub agents: Arc<AgentClients>,
    pub locks: Arc<MachineLocks>,
    pub review: Arc<ReviewDispatcher>,
    pub pullers: PullerRegistry,
    pub metrics: Arc<MetricsCollector>,
}

/// Wire error envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> ApiError {
        ApiError {
            error,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> ApiError {
        ApiError::new(ErrorCode::NotFound, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> ApiError {
        ApiError::new(e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// `{offset, limit}` paging parameters with the API defaults.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
}

impl PageParams {
    const DEFAULT_LIMIT: i64 = 10;
    const MAX_LIMIT: i64 = 1000;

    pub fn offset(&self) -> i64 {
        self.offset.max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

/// `{items, total}` list envelope.
#[derive(Debug, Serialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// Build the full router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/machines",
            get(machines::list).post(machines::register),
        )
        .route(
            "/api/machines/{id}",
            get(machines::get_one)
                .put(machines::update)
                .delete(machines::delete),
        )
        .route("/api/machines/{id}/ping", post(machines::ping))
        .route("/api/machines/{id}/log-tail", get(machines::log_tail))
        .route("/api/apps", get(dhcp::list_apps))
        .route("/api/apps/{id}", get(dhcp::get_app))
        .route("/api/subnets", get(dhcp::list_subnets))
        .route("/api/subnets/{id}", get(dhcp::get_subnet))
        .route("/api/shared-networks", get(dhcp::list_shared_networks))
        .route("/api/hosts", get(dhcp::list_hosts))
        .route("/api/leases", get(dhcp::search_leases))
        .route("/api/events", get(eventsapi::list))
        .route("/api/sse", get(eventsapi::stream))
        .route("/api/daemons/{id}", put(reviewapi::update_daemon))
        .route(
            "/api/daemons/{id}/config-checkers",
            get(reviewapi::daemon_checkers).put(reviewapi::set_daemon_checker),
        )
        .route(
            "/api/daemons/{id}/config-reports",
            get(reviewapi::daemon_reports),
        )
        .route(
            "/api/daemons/{id}/config-review",
            post(reviewapi::trigger_review),
        )
        .route(
            "/api/global-config-checkers",
            get(reviewapi::global_checkers).put(reviewapi::set_global_checker),
        )
        .route("/api/pullers", get(misc::list_pullers))
        .route("/api/pullers/{id}", get(misc::get_puller))
        .route(
            "/api/settings",
            get(misc::list_settings).put(misc::set_setting),
        )
        .route("/metrics", get(misc::metrics))
        .route("/swagger.json", get(misc::swagger))
        .route("/heron-install-agent.sh", get(misc::install_script))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until cancelled.
pub async fn serve(
    bind_address: &str,
    port: u16,
    state: ApiState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((bind_address, port)).await?;
    tracing::info!(port, "REST API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;
    tracing::debug!("REST API stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pullers;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// A full in-memory API state for router tests.
    pub(crate) fn test_state() -> ApiState {
        let db = Db::open_in_memory().unwrap();
        let identity = crate::certs::ensure_server_material(&db, "heron-server").unwrap();
        let bus = Arc::new(EventBus::new(db.clone()));
        let agents = Arc::new(AgentClients::new(
            identity,
            std::time::Duration::from_millis(300),
        ));
        let locks = Arc::new(MachineLocks::new());
        let review = ReviewDispatcher::new(db.clone(), bus.clone());
        let deps = Arc::new(pullers::PullerDeps {
            db: db.clone(),
            agents: agents.clone(),
            locks: locks.clone(),
            bus: bus.clone(),
            review: review.clone(),
        });
        let registry = pullers::build_registry(deps);
        ApiState {
            db: db.clone(),
            bus,
            agents,
            locks,
            review,
            pullers: registry,
            metrics: Arc::new(MetricsCollector::new(db)),
        }
    }

    pub(crate) async fn get_json(
        state: ApiState,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn unknown_machine_is_404_with_error_envelope() {
        let (status, body) = get_json(test_state(), "/api/machines/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn page_params_clamp() {
        let page = PageParams {
            offset: -3,
            limit: Some(100000),
        };
        assert_eq!(page.offset(), 0);
        assert_eq!(page.limit(), 1000);
        let default = PageParams {
            offset: 0,
            limit: None,
        };
        assert_eq!(default.limit(), 10);
    }
}
