//! The configuration review engine.
//!
//! A review runs every registered checker against one daemon's parsed
//! configuration and stores the resulting reports. Reviews are
//! single-flight per daemon: a trigger arriving while a review runs is
//! coalesced into at most one queued follow-up run.

pub mod checkers;
pub mod context;
pub mod overlaps;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use context::{Report, ReviewContext, Trigger};

use crate::events::EventBus;
use crate::store::event::{Level, Relations};
use crate::store::{app, review as review_store, Db};

#[derive(Default)]
struct DaemonReviewState {
    running: bool,
    queued: Option<Trigger>,
}

/// Serializes reviews per daemon and coalesces triggers.
pub struct ReviewDispatcher {
    db: Db,
    bus: Arc<EventBus>,
    states: Mutex<HashMap<i64, DaemonReviewState>>,
}

impl ReviewDispatcher {
    pub fn new(db: Db, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(ReviewDispatcher {
            db,
            bus,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Request a review. If one is already running for the daemon, the
    /// current run completes and one follow-up run is scheduled.
    pub fn trigger(self: &Arc<Self>, daemon_id: i64, trigger: Trigger) {
        {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(daemon_id).or_default();
            if state.running {
                state.queued = Some(trigger);
                return;
            }
            state.running = true;
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run_and_drain(daemon_id, trigger).await;
        });
    }

    async fn run_and_drain(self: Arc<Self>, daemon_id: i64, mut trigger: Trigger) {
        loop {
            if let Err(e) = self.run_review(daemon_id, trigger) {
                tracing::warn!(daemon_id, error = %e, "Configuration review failed");
            }
            let mut states = self.states.lock().unwrap();
            let state = states.entry(daemon_id).or_default();
            match state.queued.take() {
                Some(queued) => trigger = queued,
                None => {
                    state.running = false;
                    break;
                }
            }
        }
    }

    fn run_review(&self, daemon_id: i64, trigger: Trigger) -> crate::store::Result<()> {
        let daemon = app::get_daemon(&self.db.connection(), daemon_id)?;
        let Some(config_hash) = daemon.config_hash.clone() else {
            tracing::debug!(daemon_id, "Skipping review: no configuration yet");
            return Ok(());
        };

        let context = ReviewContext::new(&daemon, Some(&self.db), trigger);
        let Some(context) = context else {
            tracing::debug!(daemon_id, "Skipping review: configuration is not reviewable");
            return Ok(());
        };

        let mut reports: Vec<(String, Option<String>, Vec<i64>)> = Vec::new();
        let mut findings = 0usize;
        for &(name, checker) in checkers::registry() {
            let enabled = review_store::checker_enabled_for_daemon(
                &self.db.connection(),
                daemon_id,
                name,
            )?;
            if !enabled {
                continue;
            }
            match checker(&context) {
                Ok(Some(report)) => {
                    findings += 1;
                    reports.push((name.to_string(), Some(report.content), report.refs));
                }
                Ok(None) => reports.push((name.to_string(), None, Vec::new())),
                Err(e) => {
                    tracing::warn!(daemon_id, checker = name, error = %e, "Checker failed");
                }
            }
        }

        review_store::store_review(&self.db.connection(), daemon_id, &config_hash, &reports)?;

        let _ = self.bus.emit(
            Level::Info,
            &format!(
                "Configuration review for {} finished with {} finding{}",
                daemon.name,
                findings,
                if findings == 1 { "" } else { "s" }
            ),
            None,
            Relations {
                daemon_id: Some(daemon_id),
                app_id: Some(daemon.app_id),
                ..Default::default()
            },
        );
        Ok(())
    }
}

/// Substitute the `{daemon}` placeholder with the daemon's display name.
pub fn render_content(content: &str, daemon_name: &str) -> String {
    content.replace("{daemon}", daemon_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::machine;

    fn setup_daemon_with_config(db: &Db, config: serde_json::Value) -> i64 {
        let conn = db.connection();
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
        app::update_daemon_config(&conn, daemon_id, &config).unwrap();
        daemon_id
    }

    #[tokio::test]
    async fn trigger_runs_review_and_stores_reports() {
        let db = Db::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new(db.clone()));
        let daemon_id = setup_daemon_with_config(&db, serde_json::json!({"Dhcp4": {}}));

        let dispatcher = ReviewDispatcher::new(db.clone(), bus);
        dispatcher.trigger(daemon_id, Trigger::Manual);

        // Wait for the spawned review to finish.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if review_store::get_review(&db.connection(), daemon_id)
                .unwrap()
                .is_some()
            {
                break;
            }
        }

        let reports =
            review_store::list_reports(&db.connection(), daemon_id, true).unwrap();
        // An empty Dhcp4 config at least misses the stat_cmds library.
        assert!(reports
            .iter()
            .any(|report| report.checker_name == "stat_cmds_presence"));
    }

    #[tokio::test]
    async fn disabled_checker_is_skipped() {
        let db = Db::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new(db.clone()));
        let daemon_id = setup_daemon_with_config(&db, serde_json::json!({"Dhcp4": {}}));
        review_store::set_global_checker(&db.connection(), "stat_cmds_presence", false)
            .unwrap();

        let dispatcher = ReviewDispatcher::new(db.clone(), bus);
        dispatcher.trigger(daemon_id, Trigger::Manual);
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if review_store::get_review(&db.connection(), daemon_id)
                .unwrap()
                .is_some()
            {
                break;
            }
        }

        let reports =
            review_store::list_reports(&db.connection(), daemon_id, false).unwrap();
        assert!(!reports
            .iter()
            .any(|report| report.checker_name == "stat_cmds_presence"));
    }

    #[test]
    fn render_substitutes_placeholder() {
        assert_eq!(
            render_content("{daemon} configuration is fine", "dhcp4"),
            "dhcp4 configuration is fine"
        );
    }
}
