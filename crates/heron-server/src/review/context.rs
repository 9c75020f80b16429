//! The review context handed to each checker.

use std::cell::OnceCell;

use heron_keacfg::{KeaConfig, SharedNetworkCfg, SubnetCfg};

use crate::store::app::Daemon;
use crate::store::Db;

/// What caused a review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    ConfigChange,
    Periodic,
}

/// A checker finding. `content` embeds a `{daemon}` placeholder the
/// renderer substitutes with the daemon's display name; `refs` lists the
/// daemons the finding concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub content: String,
    pub refs: Vec<i64>,
}

impl Report {
    pub fn new(daemon_id: i64, content: impl Into<String>) -> Report {
        Report {
            content: content.into(),
            refs: vec![daemon_id],
        }
    }
}

/// Carries the daemon, its parsed configuration, the database handle,
/// and a scratch cache so checkers do not re-walk the configuration.
pub struct ReviewContext<'a> {
    pub daemon_id: i64,
    pub daemon_name: String,
    pub config: KeaConfig,
    pub db: Option<&'a Db>,
    pub trigger: Trigger,
    subnets: OnceCell<Vec<SubnetCfg>>,
    shared_networks: OnceCell<Vec<SharedNetworkCfg>>,
}

impl<'a> ReviewContext<'a> {
    /// Build a context from a stored daemon. `None` when the daemon has
    /// no configuration or it is not a DHCP configuration.
    pub fn new(daemon: &Daemon, db: Option<&'a Db>, trigger: Trigger) -> Option<ReviewContext<'a>> {
        let config = KeaConfig::from_value(daemon.config.clone()?);
        config.family()?;
        Some(ReviewContext {
            daemon_id: daemon.id,
            daemon_name: daemon.name.clone(),
            config,
            db,
            trigger,
            subnets: OnceCell::new(),
            shared_networks: OnceCell::new(),
        })
    }

    /// Context over a bare configuration, used by checker tests.
    pub fn from_config(daemon_id: i64, config: KeaConfig, db: Option<&'a Db>) -> ReviewContext<'a> {
        ReviewContext {
            daemon_id,
            daemon_name: match config.family() {
                Some(heron_common::addr::Family::V6) => "dhcp6".to_string(),
                _ => "dhcp4".to_string(),
            },
            config,
            db,
            trigger: Trigger::Manual,
            subnets: OnceCell::new(),
            shared_networks: OnceCell::new(),
        }
    }

    /// Every subnet of the daemon, cached across checkers.
    pub fn all_subnets(&self) -> &[SubnetCfg] {
        self.subnets.get_or_init(|| self.config.all_subnets())
    }

    /// The shared networks of the daemon, cached across checkers.
    pub fn shared_networks(&self) -> &[SharedNetworkCfg] {
        self.shared_networks
            .get_or_init(|| self.config.shared_networks())
    }

    /// Top-level subnets only, for scope-sensitive checkers. The cached
    /// `all_subnets` view lists top-level subnets first.
    pub fn top_level_subnets(&self) -> Vec<&SubnetCfg> {
        let in_networks: usize = self
            .shared_networks()
            .iter()
            .map(|network| network.subnets.len())
            .sum();
        let top_level = self.all_subnets().len() - in_networks;
        self.all_subnets().iter().take(top_level).collect()
    }

    pub fn report(&self, content: impl Into<String>) -> Report {
        Report::new(self.daemon_id, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_requires_dhcp_configuration() {
        let daemon = Daemon {
            id: 1,
            created_at: chrono::Utc::now(),
            app_id: 1,
            name: "ca".to_string(),
            active: true,
            monitored: true,
            version: None,
            uptime: None,
            reloaded_at: None,
            last_error: None,
            reload_count: 0,
            config: Some(serde_json::json!({"Control-agent": {}})),
            config_hash: Some("x".to_string()),
        };
        assert!(ReviewContext::new(&daemon, None, Trigger::Manual).is_none());

        let dhcp = Daemon {
            name: "dhcp4".to_string(),
            config: Some(serde_json::json!({"Dhcp4": {}})),
            ..daemon
        };
        assert!(ReviewContext::new(&dhcp, None, Trigger::Manual).is_some());
    }

    #[test]
    fn subnet_cache_is_reused() {
        let config = KeaConfig::from_json(
            r#"{ "Dhcp4": { "subnet4": [ { "subnet": "192.0.2.0/24" } ] } }"#,
        )
        .unwrap();
        let ctx = ReviewContext::from_config(1, config, None);
        let first = ctx.all_subnets().as_ptr();
        let second = ctx.all_subnets().as_ptr();
        assert_eq!(first, second);
        assert_eq!(ctx.all_subnets().len(), 1);
    }
}
