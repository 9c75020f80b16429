//! The Prometheus collector.
//!
//! Gauges update from one store snapshot per scrape, then the whole
//! registry encodes; a partial snapshot is never emitted.

use prometheus::{Encoder, GaugeVec, IntGauge, Opts, Registry, TextEncoder};

use crate::store::{metrics as metrics_store, Db, Result};

pub struct MetricsCollector {
    db: Db,
    registry: Registry,
    authorized_machines: IntGauge,
    unauthorized_machines: IntGauge,
    unreachable_machines: IntGauge,
    subnet_addr_utilization: GaugeVec,
    subnet_pd_utilization: GaugeVec,
    shared_network_addr_utilization: GaugeVec,
    shared_network_pd_utilization: GaugeVec,
}

impl MetricsCollector {
    pub fn new(db: Db) -> MetricsCollector {
        let registry = Registry::new();
        let authorized_machines = IntGauge::new(
            "heron_server_authorized_machines_total",
            "Authorized machines in the fleet",
        )
        .unwrap();
        let unauthorized_machines = IntGauge::new(
            "heron_server_unauthorized_machines_total",
            "Machines pending authorization",
        )
        .unwrap();
        let unreachable_machines = IntGauge::new(
            "heron_server_unreachable_machines_total",
            "Machines whose last contact failed",
        )
        .unwrap();
        let subnet_addr_utilization = GaugeVec::new(
            Opts::new(
                "heron_server_subnet_address_utilization",
                "Address utilization of a subnet (ratio)",
            ),
            &["prefix"],
        )
        .unwrap();
        let subnet_pd_utilization = GaugeVec::new(
            Opts::new(
                "heron_server_subnet_pd_utilization",
                "Delegated prefix utilization of a subnet (ratio)",
            ),
            &["prefix"],
        )
        .unwrap();
        let shared_network_addr_utilization = GaugeVec::new(
            Opts::new(
                "heron_server_shared_network_address_utilization",
                "Address utilization of a shared network (ratio)",
            ),
            &["name"],
        )
        .unwrap();
        let shared_network_pd_utilization = GaugeVec::new(
            Opts::new(
                "heron_server_shared_network_pd_utilization",
                "Delegated prefix utilization of a shared network (ratio)",
            ),
            &["name"],
        )
        .unwrap();

        registry.register(Box::new(authorized_machines.clone())).unwrap();
        registry.register(Box::new(unauthorized_machines.clone())).unwrap();
        registry.register(Box::new(unreachable_machines.clone())).unwrap();
        registry.register(Box::new(subnet_addr_utilization.clone())).unwrap();
        registry.register(Box::new(subnet_pd_utilization.clone())).unwrap();
        registry
            .register(Box::new(shared_network_addr_utilization.clone()))
            .unwrap();
        registry
            .register(Box::new(shared_network_pd_utilization.clone()))
            .unwrap();

        MetricsCollector {
            db,
            registry,
            authorized_machines,
            unauthorized_machines,
            unreachable_machines,
            subnet_addr_utilization,
            subnet_pd_utilization,
            shared_network_addr_utilization,
            shared_network_pd_utilization,
        }
    }

    /// Refresh from one snapshot and render the exposition text.
    pub fn render(&self) -> Result<String> {
        let snapshot = metrics_store::calculate(&self.db.connection())?;

        self.authorized_machines.set(snapshot.authorized_machines);
        self.unauthorized_machines.set(snapshot.unauthorized_machines);
        self.unreachable_machines.set(snapshot.unreachable_machines);

        // Reset the vecs so removed subnets drop their series.
        self.subnet_addr_utilization.reset();
        self.subnet_pd_utilization.reset();
        self.shared_network_addr_utilization.reset();
        self.shared_network_pd_utilization.reset();

        for subnet in &snapshot.subnets {
            self.subnet_addr_utilization
                .with_label_values(&[subnet.label.as_str()])
                .set(f64::from(subnet.addr_utilization) / 1000.0);
            self.subnet_pd_utilization
                .with_label_values(&[subnet.label.as_str()])
                .set(f64::from(subnet.pd_utilization) / 1000.0);
        }
        for network in &snapshot.shared_networks {
            self.shared_network_addr_utilization
                .with_label_values(&[network.label.as_str()])
                .set(f64::from(network.addr_utilization) / 1000.0);
            self.shared_network_pd_utilization
                .with_label_values(&[network.label.as_str()])
                .set(f64::from(network.pd_utilization) / 1000.0);
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| crate::store::StoreError::Migration(format!("metrics encoding: {e}")))?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}
