//! The periodic puller scheduler.
//!
//! A puller is `(name, interval setting name, work)`. Each puller owns
//! one task that never overlaps itself; distinct pullers run in parallel.
//! The interval is re-read from the settings table on every tick, so
//! operator changes take effect at the next boundary; zero or a negative
//! value disables the puller while preserving `last_executed_at`. A tick
//! exceeding its interval is aborted with a warning.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::store::{settings, Db};

/// Margin subtracted from the interval to form the tick deadline.
const TICK_MARGIN: Duration = Duration::from_millis(500);

/// How often a disabled puller re-checks its interval setting.
const DISABLED_POLL: Duration = Duration::from_secs(10);

type WorkFn = Arc<
    dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Metadata the `/api/pullers` endpoints expose.
#[derive(Debug, Clone, Serialize)]
pub struct PullerStatus {
    pub name: String,
    pub id: String,
    pub interval: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// One periodic reconciliation task.
pub struct PeriodicPuller {
    name: String,
    interval_setting_name: String,
    default_interval: i64,
    last_executed_at: Mutex<Option<DateTime<Utc>>>,
    work: WorkFn,
}

impl PeriodicPuller {
    pub fn new<F, Fut>(
        name: &str,
        interval_setting_name: &str,
        default_interval: i64,
        work: F,
    ) -> Arc<PeriodicPuller>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(PeriodicPuller {
            name: name.to_string(),
            interval_setting_name: interval_setting_name.to_string(),
            default_interval,
            last_executed_at: Mutex::new(None),
            work: Arc::new(move |cancel| Box::pin(work(cancel))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval_setting_name(&self) -> &str {
        &self.interval_setting_name
    }

    /// The currently configured interval in seconds.
    pub fn interval(&self, db: &Db) -> i64 {
        settings::get_int(&db.connection(), &self.interval_setting_name)
            .ok()
            .flatten()
            .unwrap_or(self.default_interval)
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        *self.last_executed_at.lock().unwrap()
    }

    pub fn status(&self, db: &Db) -> PullerStatus {
        PullerStatus {
            name: self.name.clone(),
            id: self.interval_setting_name.clone(),
            interval: self.interval(db),
            last_executed_at: self.last_executed_at(),
        }
    }

    /// Run one tick now, bounded by the current interval minus a margin.
    pub async fn tick(&self, db: &Db, cancel: &CancellationToken) {
        let interval = self.interval(db);
        if interval <= 0 {
            return;
        }
        *self.last_executed_at.lock().unwrap() = Some(Utc::now());

        let deadline = Duration::from_secs(interval as u64)
            .checked_sub(TICK_MARGIN)
            .unwrap_or(TICK_MARGIN);
        let work = (self.work)(cancel.clone());
        match tokio::time::timeout(deadline, work).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(puller = %self.name, error = %e, "Puller tick failed");
            }
            Err(_) => {
                tracing::warn!(puller = %self.name, deadline = ?deadline,
                    "Puller tick exceeded its deadline and was aborted");
            }
        }
    }

    /// The puller's scheduling loop: sleep the configured interval, run
    /// one tick, repeat. Never overlaps itself.
    pub async fn run(self: Arc<Self>, db: Db, cancel: CancellationToken) {
        loop {
            let interval = self.interval(&db);
            let sleep = if interval <= 0 {
                DISABLED_POLL
            } else {
                Duration::from_secs(interval as u64)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {
                    if interval > 0 {
                        self.tick(&db, &cancel).await;
                    }
                }
            }
        }
        tracing::debug!(puller = %self.name, "Puller stopped");
    }
}

/// The explicit puller registry backing the `/api/pullers` endpoints.
#[derive(Default, Clone)]
pub struct PullerRegistry {
    pullers: Vec<Arc<PeriodicPuller>>,
}

impl PullerRegistry {
    pub fn new() -> Self {
        PullerRegistry::default()
    }

    pub fn register(&mut self, puller: Arc<PeriodicPuller>) {
        self.pullers.push(puller);
    }

    pub fn statuses(&self, db: &Db) -> Vec<PullerStatus> {
        self.pullers.iter().map(|puller| puller.status(db)).collect()
    }

    pub fn status_by_id(&self, db: &Db, id: &str) -> Option<PullerStatus> {
        self.pullers
            .iter()
            .find(|puller| puller.interval_setting_name() == id)
            .map(|puller| puller.status(db))
    }

    /// Spawn one task per registered puller.
    pub fn spawn_all(
        &self,
        db: &Db,
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.pullers
            .iter()
            .map(|puller| {
                let puller = puller.clone();
                let db = db.clone();
                let cancel = cancel.clone();
                tokio::spawn(puller.run(db, cancel))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_puller(
        counter: Arc<AtomicUsize>,
        setting: &str,
    ) -> Arc<PeriodicPuller> {
        PeriodicPuller::new("test", setting, 60, move |_cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn tick_runs_work_and_stamps_time() {
        let db = Db::open_in_memory().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let puller = counter_puller(counter.clone(), "test_interval");
        assert!(puller.last_executed_at().is_none());

        puller.tick(&db, &CancellationToken::new()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(puller.last_executed_at().is_some());
    }

    #[tokio::test]
    async fn zero_interval_disables_and_preserves_last_run() {
        let db = Db::open_in_memory().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let puller = counter_puller(counter.clone(), "test_interval");

        puller.tick(&db, &CancellationToken::new()).await;
        let stamp = puller.last_executed_at();

        settings::set(&db.connection(), "test_interval", "0").unwrap();
        puller.tick(&db, &CancellationToken::new()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(puller.last_executed_at(), stamp);
    }

    #[tokio::test]
    async fn interval_reads_setting_each_time() {
        let db = Db::open_in_memory().unwrap();
        let puller = counter_puller(Arc::new(AtomicUsize::new(0)), "test_interval");
        assert_eq!(puller.interval(&db), 60);
        settings::set(&db.connection(), "test_interval", "5").unwrap();
        assert_eq!(puller.interval(&db), 5);
    }

    #[tokio::test]
    async fn overlong_tick_is_aborted() {
        let db = Db::open_in_memory().unwrap();
        settings::set(&db.connection(), "slow_interval", "1").unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let inner = finished.clone();
        let puller = PeriodicPuller::new("slow", "slow_interval", 1, move |_cancel| {
            let finished = inner.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::pause();
        let db2 = db.clone();
        let tick = tokio::spawn({
            let puller = puller.clone();
            async move { puller.tick(&db2, &CancellationToken::new()).await }
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        tick.await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registry_lists_statuses() {
        let db = Db::open_in_memory().unwrap();
        let mut registry = PullerRegistry::new();
        registry.register(counter_puller(
            Arc::new(AtomicUsize::new(0)),
            "a_interval",
        ));
        registry.register(counter_puller(
            Arc::new(AtomicUsize::new(0)),
            "b_interval",
        ));

        let statuses = registry.statuses(&db);
        assert_eq!(statuses.len(), 2);
        assert!(registry.status_by_id(&db, "a_interval").is_some());
        assert!(registry.status_by_id(&db, "missing").is_none());
    }
}
