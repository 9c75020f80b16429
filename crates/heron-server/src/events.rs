//! The event bus.
//!
//! Every event is appended to the store (the durable log the REST API
//! pages through) and fanned out over a broadcast channel to live SSE
//! subscribers. The channel is bounded: a subscriber that lags behind
//! the buffer is disconnected rather than buffered without limit.

use tokio::sync::broadcast;

use crate::store::event::{self, Event, Level, Relations};
use crate::store::{settings, Db, Result};

/// Broadcast buffer per subscriber before lag disconnects them.
const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    db: Db,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(db: Db) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus { db, sender }
    }

    /// Append an event and deliver it to subscribers. Ordering is the
    /// store's monotonic id.
    pub fn emit(
        &self,
        level: Level,
        text: &str,
        details: Option<&str>,
        relations: Relations,
    ) -> Result<Event> {
        let stored = event::add(&self.db.connection(), level, text, details, relations)?;
        // No receivers is fine; the store keeps the log.
        let _ = self.sender.send(stored.clone());
        match level {
            Level::Info => tracing::info!(event = %text, "Event"),
            Level::Warn => tracing::warn!(event = %text, "Event"),
            Level::Error => tracing::error!(event = %text, "Event"),
        }
        trim_retention(&self.db);
        Ok(stored)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// Best-effort retention trim after each append.
fn trim_retention(db: &Db) {
    let conn = db.connection();
    let keep = settings::get_int(&conn, "event_retention_count")
        .ok()
        .flatten()
        .unwrap_or(10000);
    if let Err(e) = event::trim(&conn, keep) {
        tracing::warn!(error = %e, "Event retention trim failed");
    }
}
