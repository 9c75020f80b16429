//! The event log endpoints: paged listing and the SSE stream.
//!
//! `GET /api/sse` first replays a finite historical window (resuming
//! from `Last-Event-ID` when the client reconnects), then streams live
//! events. Frames carry `id: <monotonic>` so resumption is lossless
//! within the retention window. A subscriber that falls behind the
//! broadcast buffer is disconnected.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tokio_stream::Stream;

use crate::store::app;
use crate::store::event::{self, Event, Level};

use super::{ApiError, ApiState, ListPage, PageParams};

/// How many historical events a fresh subscriber receives.
const HISTORY_WINDOW: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    pub machine: Option<i64>,
    pub level: Option<Level>,
}

pub async fn list(
    State(state): State<ApiState>,
    Query(page): Query<PageParams>,
    Query(filter): Query<EventFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let (items, total) = event::list(
        &state.db.connection(),
        page.offset(),
        page.limit(),
        filter.machine,
        filter.level,
    )?;
    Ok(Json(ListPage { items, total }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamFilter {
    pub machine: Option<i64>,
    #[serde(rename = "appType")]
    pub app_type: Option<String>,
    #[serde(rename = "daemonType")]
    pub daemon_type: Option<String>,
    pub user: Option<i64>,
    pub level: Option<Level>,
}

impl StreamFilter {
    /// Whether an event passes the filter. Type filters resolve the
    /// related app/daemon row.
    fn matches(&self, state: &ApiState, event: &Event) -> bool {
        if let Some(machine) = self.machine {
            if event.relations.machine_id != Some(machine) {
                return false;
            }
        }
        if let Some(user) = self.user {
            if event.relations.user_id != Some(user) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if event.level < level {
                return false;
            }
        }
        if let Some(app_type) = &self.app_type {
            let Some(app_id) = event.relations.app_id else {
                return false;
            };
            let matches = app::get_app(&state.db.connection(), app_id)
                .map(|stored| stored.app_type == *app_type)
                .unwrap_or(false);
            if !matches {
                return false;
            }
        }
        if let Some(daemon_type) = &self.daemon_type {
            let Some(daemon_id) = event.relations.daemon_id else {
                return false;
            };
            let matches = app::get_daemon(&state.db.connection(), daemon_id)
                .map(|daemon| daemon.name == *daemon_type)
                .unwrap_or(false);
            if !matches {
                return false;
            }
        }
        true
    }
}

fn frame(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().id(event.id.to_string()).data(data)
}

pub async fn stream(
    State(state): State<ApiState>,
    Query(filter): Query<StreamFilter>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    // Resume point: Last-Event-ID wins over the default window.
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok());

    let mut receiver = state.bus.subscribe();
    let history = {
        let conn = state.db.connection();
        match last_event_id {
            Some(after) => event::list_after(&conn, after, HISTORY_WINDOW).unwrap_or_default(),
            None => {
                let (mut newest_first, _) = event::list(&conn, 0, HISTORY_WINDOW, None, None)
                    .unwrap_or((Vec::new(), 0));
                newest_first.reverse();
                newest_first
            }
        }
    };

    let stream = async_stream::stream! {
        let mut last_sent = 0i64;
        for event in &history {
            if filter.matches(&state, event) {
                last_sent = event.id;
                yield Ok(frame(event));
            }
        }
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    // The broadcast may replay events already served
                    // from history.
                    if event.id <= last_sent {
                        continue;
                    }
                    if filter.matches(&state, &event) {
                        last_sent = event.id;
                        yield Ok(frame(&event));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "SSE subscriber lagged; disconnecting");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
}
