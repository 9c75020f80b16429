//! The periodic pullers.
//!
//! Each puller reconciles one slice of remote state: machine
//! reachability and app inventory, daemon status, lease statistics, host
//! reservations, HA state, and configuration review staleness.

pub mod app_state;
pub mod config_review;
pub mod ha_status;
pub mod kea_hosts;
pub mod kea_stats;
pub mod machine_state;

use std::sync::Arc;

use crate::agentcomm::AgentClients;
use crate::events::EventBus;
use crate::puller::{PeriodicPuller, PullerRegistry};
use crate::reconcile::MachineLocks;
use crate::review::ReviewDispatcher;
use crate::store::Db;

/// Everything a puller tick needs.
pub struct PullerDeps {
    pub db: Db,
    pub agents: Arc<AgentClients>,
    pub locks: Arc<MachineLocks>,
    pub bus: Arc<EventBus>,
    pub review: Arc<ReviewDispatcher>,
}

macro_rules! register {
    ($registry:expr, $deps:expr, $name:literal, $setting:literal, $default:literal, $module:ident) => {{
        let deps = $deps.clone();
        $registry.register(PeriodicPuller::new(
            $name,
            $setting,
            $default,
            move |cancel| {
                let deps = deps.clone();
                async move { $module::run(deps, cancel).await }
            },
        ));
    }};
}

/// Build the explicit registry the scheduler and the `/api/pullers`
/// endpoints share. Defaults mirror the seeded settings.
pub fn build_registry(deps: Arc<PullerDeps>) -> PullerRegistry {
    let mut registry = PullerRegistry::new();
    register!(registry, deps, "machine-state", "machine_state_puller_interval", 60, machine_state);
    register!(registry, deps, "app-state", "apps_state_puller_interval", 30, app_state);
    register!(registry, deps, "kea-stats", "kea_stats_puller_interval", 60, kea_stats);
    register!(registry, deps, "kea-hosts", "kea_hosts_puller_interval", 300, kea_hosts);
    register!(registry, deps, "ha-status", "kea_status_puller_interval", 10, ha_status);
    register!(registry, deps, "config-review", "config_review_puller_interval", 86400, config_review);
    registry
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use heron_transport::material;
    use heron_transport::tls::TlsIdentity;

    pub(crate) fn test_deps() -> Arc<PullerDeps> {
        let db = Db::open_in_memory().unwrap();
        let ca = material::generate_ca().unwrap();
        let cert = material::issue_cert(&ca, "server", &["127.0.0.1".into()]).unwrap();
        let identity = TlsIdentity {
            ca_cert_pem: ca.cert_pem,
            cert_pem: cert.cert_pem,
            key_pem: cert.key_pem,
        };
        let bus = Arc::new(EventBus::new(db.clone()));
        Arc::new(PullerDeps {
            db: db.clone(),
            agents: Arc::new(AgentClients::new(
                identity,
                std::time::Duration::from_millis(300),
            )),
            locks: Arc::new(MachineLocks::new()),
            bus: bus.clone(),
            review: ReviewDispatcher::new(db, bus),
        })
    }

    #[tokio::test]
    async fn registry_contains_all_pullers() {
        let deps = test_deps();
        let registry = build_registry(deps.clone());
        let statuses = registry.statuses(&deps.db);
        let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "machine-state",
                "app-state",
                "kea-stats",
                "kea-hosts",
                "ha-status",
                "config-review"
            ]
        );
        assert_eq!(statuses[0].interval, 60);
        assert_eq!(statuses[4].id, "kea_status_puller_interval");
    }
}
