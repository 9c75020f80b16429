//! The utilization calculator.
//!
//! Folds per-subnet lease counters into shared-network and fleet-wide
//! totals. IPv4 subnets carry `{total, assigned, declined}` addresses;
//! IPv6 subnets carry NAs and PDs. A shared network mixes families by
//! summing NAs into its address totals for cross-family display.
//! Utilization is `assigned / total` with `0 / 0 = 0`; the Kea `-1`
//! overflow sentinel becomes NaN and suppresses the numeric result
//! without aborting the batch.

use std::collections::HashMap;

use heron_common::addr::Family;
use heron_common::stats::{StatValue, SubnetStats};

use crate::store::subnet::Subnet;

/// Division that yields zero instead of NaN or infinity when the
/// denominator is zero.
fn safe_div(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}

/// Utilization as an integer percentage multiplied by 10 in `[0, 1000]`.
/// NaN (invalid input upstream) is stored as zero; the statistics bag
/// keeps the sentinel for display suppression.
pub fn per_mille(utilization: f64) -> i16 {
    if !utilization.is_finite() {
        return 0;
    }
    (utilization * 1000.0).round().clamp(0.0, 1000.0) as i16
}

/// The sum of statistics from all subnets.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GlobalStats {
    pub total_addresses: f64,
    pub total_assigned_addresses: f64,
    pub total_declined_addresses: f64,
    pub total_nas: f64,
    pub total_assigned_nas: f64,
    pub total_declined_nas: f64,
    pub total_pds: f64,
    pub total_assigned_pds: f64,
}

impl GlobalStats {
    fn add_ipv4_subnet(&mut self, subnet: &SubnetIpv4Stats) {
        self.total_addresses += subnet.total_addresses;
        self.total_assigned_addresses += subnet.total_assigned_addresses;
        self.total_declined_addresses += subnet.total_declined_addresses;
    }

    fn add_ipv6_subnet(&mut self, subnet: &SubnetIpv6Stats) {
        self.total_nas += subnet.total_nas;
        self.total_assigned_nas += subnet.total_assigned_nas;
        self.total_declined_nas += subnet.total_declined_nas;
        self.total_pds += subnet.total_pds;
        self.total_assigned_pds += subnet.total_assigned_pds;
    }

    /// Named counters for the statistic table.
    pub fn counters(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("total-addresses", self.total_addresses),
            ("assigned-addresses", self.total_assigned_addresses),
            ("declined-addresses", self.total_declined_addresses),
            ("total-nas", self.total_nas),
            ("assigned-nas", self.total_assigned_nas),
            ("declined-nas", self.total_declined_nas),
            ("total-pds", self.total_pds),
            ("assigned-pds", self.total_assigned_pds),
        ]
    }
}

/// Sum of the subnet statistics within a single shared network.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SharedNetworkStats {
    pub total_addresses: f64,
    pub total_assigned_addresses: f64,
    pub total_pds: f64,
    pub total_assigned_pds: f64,
}

impl SharedNetworkStats {
    /// The assigned addresses include declined ones not yet reclaimed.
    pub fn address_utilization(&self) -> f64 {
        safe_div(self.total_assigned_addresses, self.total_addresses)
    }

    pub fn pd_utilization(&self) -> f64 {
        safe_div(self.total_assigned_pds, self.total_pds)
    }

    fn add_ipv4_subnet(&mut self, subnet: &SubnetIpv4Stats) {
        self.total_addresses += subnet.total_addresses;
        self.total_assigned_addresses += subnet.total_assigned_addresses;
    }

    fn add_ipv6_subnet(&mut self, subnet: &SubnetIpv6Stats) {
        self.total_addresses += subnet.total_nas;
        self.total_assigned_addresses += subnet.total_assigned_nas;
        self.total_pds += subnet.total_pds;
        self.total_assigned_pds += subnet.total_assigned_pds;
    }

    pub fn stats(&self) -> SubnetStats {
        let mut stats = SubnetStats::new();
        stats.insert("total-addresses".into(), float_stat(self.total_addresses));
        stats.insert(
            "assigned-addresses".into(),
            float_stat(self.total_assigned_addresses),
        );
        stats.insert("total-pds".into(), float_stat(self.total_pds));
        stats.insert("assigned-pds".into(), float_stat(self.total_assigned_pds));
        stats
    }
}

/// IPv4 statistics retrieved from a single subnet.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubnetIpv4Stats {
    pub total_addresses: f64,
    pub total_assigned_addresses: f64,
    pub total_declined_addresses: f64,
}

/// IPv6 statistics retrieved from a single subnet.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubnetIpv6Stats {
    pub total_nas: f64,
    pub total_assigned_nas: f64,
    pub total_declined_nas: f64,
    pub total_pds: f64,
    pub total_assigned_pds: f64,
}

/// Per-subnet lease statistics, unifying both families.
#[derive(Debug, Clone, PartialEq)]
pub enum SubnetLeaseStats {
    V4(SubnetIpv4Stats),
    V6(SubnetIpv6Stats),
}

impl SubnetLeaseStats {
    pub fn address_utilization(&self) -> f64 {
        match self {
            SubnetLeaseStats::V4(stats) => {
                safe_div(stats.total_assigned_addresses, stats.total_addresses)
            }
            SubnetLeaseStats::V6(stats) => safe_div(stats.total_assigned_nas, stats.total_nas),
        }
    }

    /// Always zero for IPv4: prefix delegation does not apply.
    pub fn pd_utilization(&self) -> f64 {
        match self {
            SubnetLeaseStats::V4(_) => 0.0,
            SubnetLeaseStats::V6(stats) => safe_div(stats.total_assigned_pds, stats.total_pds),
        }
    }

    pub fn stats(&self) -> SubnetStats {
        let mut bag = SubnetStats::new();
        match self {
            SubnetLeaseStats::V4(stats) => {
                bag.insert("total-addresses".into(), float_stat(stats.total_addresses));
                bag.insert(
                    "assigned-addresses".into(),
                    float_stat(stats.total_assigned_addresses),
                );
                bag.insert(
                    "declined-addresses".into(),
                    float_stat(stats.total_declined_addresses),
                );
            }
            SubnetLeaseStats::V6(stats) => {
                bag.insert("total-nas".into(), float_stat(stats.total_nas));
                bag.insert("assigned-nas".into(), float_stat(stats.total_assigned_nas));
                bag.insert("declined-nas".into(), float_stat(stats.total_declined_nas));
                bag.insert("total-pds".into(), float_stat(stats.total_pds));
                bag.insert("assigned-pds".into(), float_stat(stats.total_assigned_pds));
            }
        }
        bag
    }
}

fn float_stat(value: f64) -> StatValue {
    if value.is_nan() {
        StatValue::invalid()
    } else {
        StatValue::new(value as i128)
    }
}

/// The fold: subnet stats → shared-network totals → global totals.
#[derive(Debug, Default)]
pub struct UtilizationCalculator {
    pub global: GlobalStats,
    pub shared_networks: HashMap<i64, SharedNetworkStats>,
}

impl UtilizationCalculator {
    pub fn new() -> Self {
        UtilizationCalculator::default()
    }

    /// Fold in one subnet and return its own lease statistics.
    pub fn add(&mut self, subnet: &Subnet) -> SubnetLeaseStats {
        if let Some(network_id) = subnet.shared_network_id {
            self.shared_networks.entry(network_id).or_default();
        }
        match subnet.family() {
            Family::V6 => SubnetLeaseStats::V6(self.add_ipv6_subnet(subnet)),
            Family::V4 => SubnetLeaseStats::V4(self.add_ipv4_subnet(subnet)),
        }
    }

    fn add_ipv4_subnet(&mut self, subnet: &Subnet) -> SubnetIpv4Stats {
        let stats = SubnetIpv4Stats {
            total_addresses: sum_stat_local_subnets(subnet, "total-addresses"),
            total_assigned_addresses: sum_stat_local_subnets(subnet, "assigned-addresses"),
            total_declined_addresses: sum_stat_local_subnets(subnet, "declined-addresses"),
        };
        if let Some(network_id) = subnet.shared_network_id {
            if let Some(network) = self.shared_networks.get_mut(&network_id) {
                network.add_ipv4_subnet(&stats);
            }
        }
        self.global.add_ipv4_subnet(&stats);
        stats
    }

    fn add_ipv6_subnet(&mut self, subnet: &Subnet) -> SubnetIpv6Stats {
        let stats = SubnetIpv6Stats {
            total_nas: sum_stat_local_subnets(subnet, "total-nas"),
            total_assigned_nas: sum_stat_local_subnets(subnet, "assigned-nas"),
            total_declined_nas: sum_stat_local_subnets(subnet, "declined-nas"),
            total_pds: sum_stat_local_subnets(subnet, "total-pds"),
            total_assigned_pds: sum_stat_local_subnets(subnet, "assigned-pds"),
        };
        if let Some(network_id) = subnet.shared_network_id {
            if let Some(network) = self.shared_networks.get_mut(&network_id) {
                network.add_ipv6_subnet(&stats);
            }
        }
        self.global.add_ipv6_subnet(&stats);
        stats
    }
}

/// The sum of one statistic over every local subnet of the subnet. The
/// `-1` overflow sentinel poisons the whole sum with NaN.
fn sum_stat_local_subnets(subnet: &Subnet, name: &str) -> f64 {
    let mut sum = 0.0;
    for local_subnet in &subnet.local_subnets {
        let value = local_subnet
            .stats
            .as_ref()
            .and_then(|stats| stats.get(name))
            .copied()
            .unwrap_or(StatValue::new(0));
        if value.is_invalid() {
            return f64::NAN;
        }
        sum += value.as_f64();
    }
    sum
}
