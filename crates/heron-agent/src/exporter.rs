//! The agent's HTTP endpoint: health probe and Prometheus re-export.
//!
//! `/metrics` serves the agent's own gauges and relays the exposition
//! text of any configured downstream scrape targets (the Prometheus
//! endpoints of locally running daemons). A failing target becomes a
//! comment in the output instead of failing the whole scrape.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use heron_transport::rpc::AppType;

use crate::monitor::AppMonitor;

#[derive(Clone)]
pub struct ExporterState {
    monitor: Arc<AppMonitor>,
    client: reqwest::Client,
    scrape_targets: Arc<Vec<String>>,
    registry: Registry,
    detected_apps: IntGaugeVec,
    uptime: IntGauge,
    started_at: std::time::Instant,
}

impl ExporterState {
    pub fn new(
        monitor: Arc<AppMonitor>,
        client: reqwest::Client,
        scrape_targets: Vec<String>,
    ) -> Self {
        let registry = Registry::new();
        let detected_apps = IntGaugeVec::new(
            Opts::new("heron_agent_detected_apps", "Locally detected apps by type"),
            &["app_type"],
        )
        .unwrap();
        let uptime = IntGauge::new("heron_agent_uptime_seconds", "Agent uptime").unwrap();
        registry.register(Box::new(detected_apps.clone())).unwrap();
        registry.register(Box::new(uptime.clone())).unwrap();
        ExporterState {
            monitor,
            client,
            scrape_targets: Arc::new(scrape_targets),
            registry,
            detected_apps,
            uptime,
            started_at: std::time::Instant::now(),
        }
    }
}

pub fn routes(state: ExporterState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub async fn serve(
    port: u16,
    state: ExporterState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Metrics endpoint listening");
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<ExporterState>) -> impl IntoResponse {
    let apps = state.monitor.apps();
    for app_type in [AppType::Kea, AppType::Bind9] {
        let count = apps.iter().filter(|a| a.app_type == app_type).count();
        state
            .detected_apps
            .with_label_values(&[app_type.as_str()])
            .set(count as i64);
    }
    state.uptime.set(state.started_at.elapsed().as_secs() as i64);

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("# metrics encoding failed: {e}\n"),
        );
    }
    let mut body = String::from_utf8_lossy(&buffer).to_string();

    for target in state.scrape_targets.iter() {
        body.push_str(&format!("\n# relayed from {target}\n"));
        match relay_target(&state.client, target).await {
            Ok(text) => body.push_str(&text),
            Err(e) => body.push_str(&format!("# scrape failed: {e}\n")),
        }
    }

    (StatusCode::OK, body)
}

async fn relay_target(client: &reqwest::Client, target: &str) -> Result<String, reqwest::Error> {
    client.get(target).send().await?.text().await
}
