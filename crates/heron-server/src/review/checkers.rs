//! The built-in configuration checkers.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::Ipv6Net;

use heron_common::addr::canonical_prefix;
use heron_keacfg::SubnetCfg;

use crate::review::context::{Report, ReviewContext};
use crate::review::overlaps::find_overlaps;
use crate::store::{host, subnet as subnet_store, Result};

/// Cap on reported overlapping pairs.
const MAX_OVERLAPS: usize = 10;

pub type Checker = fn(&ReviewContext) -> Result<Option<Report>>;

/// The checker registry, in execution order. Names are the stable ids
/// used by the checker controller scopes.
pub fn registry() -> &'static [(&'static str, Checker)] {
    &[
        ("stat_cmds_presence", stat_cmds_presence),
        ("host_cmds_presence", host_cmds_presence),
        ("shared_network_dispensable", shared_network_dispensable),
        ("subnet_dispensable", subnet_dispensable),
        ("reservations_out_of_pool", reservations_out_of_pool),
        ("subnets_overlapping", subnets_overlapping),
        ("canonical_prefixes", canonical_prefixes),
    ]
}

fn count(n: usize, singular: &str, plural: &str) -> String {
    if n == 1 {
        format!("{n} {singular}")
    } else {
        format!("{n} {plural}")
    }
}

/// The stat_cmds hook library provides the statistic counters the
/// dashboard relies on.
fn stat_cmds_presence(ctx: &ReviewContext) -> Result<Option<Report>> {
    if ctx.config.has_hook_library("libdhcp_stat_cmds") {
        return Ok(None);
    }
    Ok(Some(ctx.report(
        "The Kea Statistics Commands library (libdhcp_stat_cmds) is not loaded. \
         {daemon} will not report lease statistic counters, so pool utilization \
         cannot be calculated. Consider loading the library.",
    )))
}

/// A configured hosts database without host_cmds means the reservations
/// stored there stay invisible.
fn host_cmds_presence(ctx: &ReviewContext) -> Result<Option<Report>> {
    if !ctx.config.has_hosts_backend() || ctx.config.has_hook_library("libdhcp_host_cmds") {
        return Ok(None);
    }
    Ok(Some(ctx.report(
        "Kea can be configured to store host reservations in a database. \
         {daemon} is configured to use a hosts database, but the Kea Host \
         Commands library (libdhcp_host_cmds) is not loaded. Host reservations \
         from the database are not fetched and will not be visible.",
    )))
}

/// Shared networks with no subnet or a single subnet add configuration
/// overhead without changing the allocation behavior.
fn shared_network_dispensable(ctx: &ReviewContext) -> Result<Option<Report>> {
    let mut empty = 0usize;
    let mut single = 0usize;
    for network in ctx.shared_networks() {
        match network.subnets.len() {
            0 => empty += 1,
            1 => single += 1,
            _ => {}
        }
    }
    if empty == 0 && single == 0 {
        return Ok(None);
    }

    let empty_part = count(empty, "empty shared network", "empty shared networks");
    let single_part = count(
        single,
        "shared network with only a single subnet",
        "shared networks with only a single subnet",
    );
    let summary = match (empty, single) {
        (0, _) => single_part,
        (_, 0) => empty_part,
        _ => format!("{empty_part} and {single_part}"),
    };
    Ok(Some(ctx.report(format!(
        "{{daemon}} configuration includes {summary}. Shared networks that \
         serve no subnet, or a single subnet only, can be removed and their \
         subnets declared at the top level."
    ))))
}

/// True when the subnet has a reservation visible to the daemon in the
/// host database; consulted only when host_cmds is loaded.
fn has_database_reservations(ctx: &ReviewContext, subnet_cfg: &SubnetCfg) -> Result<bool> {
    let Some(db) = ctx.db else {
        return Ok(false);
    };
    if !ctx.config.has_hook_library("libdhcp_host_cmds") {
        return Ok(false);
    }
    let Ok(prefix) = canonical_prefix(&subnet_cfg.prefix) else {
        return Ok(false);
    };
    let conn = db.connection();
    let Some(stored) = subnet_store::get_subnet_by_prefix(&conn, &prefix)? else {
        return Ok(false);
    };
    host::subnet_has_reservations(&conn, stored.id, ctx.daemon_id)
}

/// Reserved addresses of the subnet stored in the host database for this
/// daemon; empty unless host_cmds is loaded.
fn database_reservations(ctx: &ReviewContext, subnet_cfg: &SubnetCfg) -> Result<Vec<String>> {
    let Some(db) = ctx.db else {
        return Ok(Vec::new());
    };
    if !ctx.config.has_hook_library("libdhcp_host_cmds") {
        return Ok(Vec::new());
    }
    let Ok(prefix) = canonical_prefix(&subnet_cfg.prefix) else {
        return Ok(Vec::new());
    };
    let conn = db.connection();
    let Some(stored) = subnet_store::get_subnet_by_prefix(&conn, &prefix)? else {
        return Ok(Vec::new());
    };
    let mut addresses = Vec::new();
    for stored_host in host::hosts_of_subnet(&conn, stored.id)? {
        let for_daemon = stored_host
            .local_hosts
            .iter()
            .any(|local| local.daemon_id == ctx.daemon_id);
        if for_daemon {
            addresses.extend(stored_host.ip_reservations);
        }
    }
    Ok(addresses)
}

/// Subnets with no pools and no host reservations hand out nothing.
fn subnet_dispensable(ctx: &ReviewContext) -> Result<Option<Report>> {
    let mut dispensable = 0usize;
    for subnet_cfg in ctx.all_subnets() {
        if subnet_cfg.has_pools() {
            continue;
        }
        let has_config_reservations = !subnet_cfg.reservations.is_empty();
        if has_config_reservations || has_database_reservations(ctx, subnet_cfg)? {
            continue;
        }
        dispensable += 1;
    }
    if dispensable == 0 {
        return Ok(None);
    }
    Ok(Some(ctx.report(format!(
        "{{daemon}} configuration includes {} without pools and host \
         reservations. They provide no service and can be removed.",
        count(dispensable, "subnet", "subnets")
    ))))
}

/// Flag subnets whose every reservation lies outside every pool; such
/// subnets benefit from the reservations-out-of-pool mode. The
/// `reservations-out-of-pool` flag at subnet, shared-network, or global
/// scope disables the check for that scope.
fn reservations_out_of_pool(ctx: &ReviewContext) -> Result<Option<Report>> {
    let global_flag = ctx.config.global_reservations_out_of_pool();
    let mut flagged = 0usize;

    let mut scopes: Vec<(Option<bool>, Vec<&SubnetCfg>)> = Vec::new();
    scopes.push((None, ctx.top_level_subnets()));
    for network in ctx.shared_networks() {
        scopes.push((network.out_of_pool_flag, network.subnets.iter().collect()));
    }

    for (network_flag, subnets) in scopes {
        for subnet_cfg in subnets {
            let effective = subnet_cfg
                .out_of_pool_flag
                .or(network_flag)
                .unwrap_or(global_flag);
            if effective {
                continue;
            }
            if subnet_qualifies_for_out_of_pool(ctx, subnet_cfg)? {
                flagged += 1;
            }
        }
    }

    if flagged == 0 {
        return Ok(None);
    }
    Ok(Some(ctx.report(format!(
        "{{daemon}} configuration includes {} in which all host reservations \
         are outside the dynamic pools. Consider enabling the \
         reservations-out-of-pool mode in these subnets for faster lease \
         allocation.",
        count(flagged, "subnet", "subnets")
    ))))
}

fn subnet_qualifies_for_out_of_pool(
    ctx: &ReviewContext,
    subnet_cfg: &SubnetCfg,
) -> Result<bool> {
    let mut addresses: Vec<String> = subnet_cfg
        .reservations
        .iter()
        .flat_map(|reservation| reservation.addresses.iter().cloned())
        .collect();
    addresses.extend(database_reservations(ctx, subnet_cfg)?);
    let prefixes: Vec<String> = subnet_cfg
        .reservations
        .iter()
        .flat_map(|reservation| reservation.prefixes.iter().cloned())
        .collect();

    // Any in-pool reservation means the subnet already mixes modes.
    for address in &addresses {
        let Ok(parsed) = IpAddr::from_str(address) else {
            continue;
        };
        if subnet_cfg.pools.iter().any(|pool| pool.contains(&parsed)) {
            return Ok(false);
        }
    }
    for prefix in &prefixes {
        let Ok(parsed) = Ipv6Net::from_str(prefix) else {
            continue;
        };
        if subnet_cfg
            .pd_pools
            .iter()
            .any(|pool| pool.contains_prefix(&parsed))
        {
            return Ok(false);
        }
    }

    let address_case = !subnet_cfg.pools.is_empty() && !addresses.is_empty();
    let prefix_case = !subnet_cfg.pd_pools.is_empty() && !prefixes.is_empty();
    Ok(address_case || prefix_case)
}

/// Overlapping subnet prefixes across the daemon's configuration.
fn subnets_overlapping(ctx: &ReviewContext) -> Result<Option<Report>> {
    let subnets: Vec<(i64, String)> = ctx
        .all_subnets()
        .iter()
        .enumerate()
        .map(|(ordinal, subnet_cfg)| {
            (
                subnet_cfg.local_id.unwrap_or(ordinal as i64 + 1),
                subnet_cfg.prefix.clone(),
            )
        })
        .collect();
    let pairs = find_overlaps(&subnets, MAX_OVERLAPS);
    if pairs.is_empty() {
        return Ok(None);
    }

    let summary = if pairs.len() >= MAX_OVERLAPS {
        format!("at least {MAX_OVERLAPS} overlapping subnet pairs")
    } else {
        count(
            pairs.len(),
            "overlapping subnet pair",
            "overlapping subnet pairs",
        )
    };
    let mut content = format!("{{daemon}} configuration includes {summary}:");
    for (position, pair) in pairs.iter().enumerate() {
        content.push_str(&format!(
            "\n{}. {} is overlapped by {}",
            position + 1,
            pair.parent.prefix,
            pair.child.prefix
        ));
    }
    Ok(Some(ctx.report(content)))
}

/// Every configured prefix must equal its canonical form: network address
/// masked to the prefix length, IPv6 zero-collapsed.
fn canonical_prefixes(ctx: &ReviewContext) -> Result<Option<Report>> {
    let mut findings: Vec<String> = Vec::new();
    for subnet_cfg in ctx.all_subnets() {
        match canonical_prefix(&subnet_cfg.prefix) {
            Ok(canonical) if canonical == subnet_cfg.prefix => {}
            Ok(canonical) => {
                findings.push(format!("{} should be {}", subnet_cfg.prefix, canonical));
            }
            Err(_) => findings.push(format!("{} is not a valid prefix", subnet_cfg.prefix)),
        }
    }
    if findings.is_empty() {
        return Ok(None);
    }

    let mut content = format!(
        "{{daemon}} configuration includes {} not in canonical form:",
        count(findings.len(), "subnet prefix", "subnet prefixes")
    );
    for (position, finding) in findings.iter().enumerate() {
        content.push_str(&format!("\n{}. {finding}", position + 1));
    }
    Ok(Some(ctx.report(content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::context::ReviewContext;
    use crate::store::{app, machine, Db};
    use heron_keacfg::KeaConfig;

    fn context(config_text: &str) -> ReviewContext<'static> {
        let config = KeaConfig::from_json(config_text).unwrap();
        ReviewContext::from_config(1, config, None)
    }

    #[test]
    fn stat_cmds_present_is_silent() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "hooks-libraries": [
                        { "library": "/usr/lib/kea/libdhcp_stat_cmds.so" }
                    ]
                }
            }"#,
        );
        assert!(stat_cmds_presence(&ctx).unwrap().is_none());
    }

    #[test]
    fn stat_cmds_absent_is_reported() {
        let ctx = context(r#"{ "Dhcp4": { } }"#);
        let report = stat_cmds_presence(&ctx).unwrap().unwrap();
        assert!(report
            .content
            .contains("The Kea Statistics Commands library"));
        assert_eq!(report.refs, vec![1]);
    }

    #[test]
    fn host_cmds_without_backend_is_silent() {
        let ctx = context(r#"{ "Dhcp4": { } }"#);
        assert!(host_cmds_presence(&ctx).unwrap().is_none());
    }

    #[test]
    fn host_cmds_present_with_backend_is_silent() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "hosts-database": [ { "type": "mysql" } ],
                    "hooks-libraries": [
                        { "library": "/usr/lib/kea/libdhcp_host_cmds.so" }
                    ]
                }
            }"#,
        );
        assert!(host_cmds_presence(&ctx).unwrap().is_none());
    }

    #[test]
    fn host_cmds_missing_with_backend_is_reported() {
        for body in [
            r#"{ "Dhcp4": { "hosts-database": { "type": "mysql" } } }"#,
            r#"{ "Dhcp4": { "hosts-databases": [ { "type": "mysql" } ] } }"#,
        ] {
            let ctx = context(body);
            let report = host_cmds_presence(&ctx).unwrap().unwrap();
            assert!(report.content.contains("Kea can be configured"), "{body}");
        }
    }

    #[test]
    fn dispensable_shared_network_empty() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "shared-networks": [
                        { "name": "foo" },
                        {
                            "name": "bar",
                            "subnet4": [
                                { "subnet": "192.0.2.0/24" },
                                { "subnet": "192.0.3.0/24" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        let report = shared_network_dispensable(&ctx).unwrap().unwrap();
        assert!(report
            .content
            .contains("configuration includes 1 empty shared network"));
    }

    #[test]
    fn dispensable_shared_network_single_subnet() {
        let ctx = context(
            r#"{
                "Dhcp6": {
                    "shared-networks": [
                        {
                            "name": "bar",
                            "subnet6": [ { "subnet": "2001:db8:1::/64" } ]
                        }
                    ]
                }
            }"#,
        );
        let report = shared_network_dispensable(&ctx).unwrap().unwrap();
        assert!(report
            .content
            .contains("configuration includes 1 shared network with only a single subnet"));
    }

    #[test]
    fn dispensable_shared_network_mixed_counts() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "shared-networks": [
                        { "name": "foo" },
                        { "name": "bar" },
                        { "name": "baz", "subnet4": [ { "subnet": "192.0.2.0/24" } ] },
                        { "name": "zab", "subnet4": [ { "subnet": "192.0.3.0/24" } ] },
                        {
                            "name": "bac",
                            "subnet4": [
                                { "subnet": "192.0.4.0/24" },
                                { "subnet": "192.0.5.0/24" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        let report = shared_network_dispensable(&ctx).unwrap().unwrap();
        assert!(report.content.contains(
            "configuration includes 2 empty shared networks and 2 shared networks \
             with only a single subnet"
        ));
    }

    #[test]
    fn well_populated_shared_networks_are_silent() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "shared-networks": [
                        {
                            "name": "bar",
                            "subnet4": [
                                { "subnet": "192.0.2.0/24" },
                                { "subnet": "192.0.3.0/24" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(shared_network_dispensable(&ctx).unwrap().is_none());
    }

    #[test]
    fn dispensable_subnets_without_pools_or_reservations() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "shared-networks": [
                        { "name": "foo", "subnet4": [ { "subnet": "192.0.2.0/24" } ] }
                    ],
                    "subnet4": [ { "subnet": "192.0.3.0/24" } ]
                }
            }"#,
        );
        let report = subnet_dispensable(&ctx).unwrap().unwrap();
        assert!(report
            .content
            .contains("configuration includes 2 subnets without pools and host reservations"));
    }

    #[test]
    fn subnet_with_pools_is_not_dispensable() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ]
                        }
                    ]
                }
            }"#,
        );
        assert!(subnet_dispensable(&ctx).unwrap().is_none());
    }

    #[test]
    fn subnet_with_pd_pool_is_not_dispensable() {
        let ctx = context(
            r#"{
                "Dhcp6": {
                    "subnet6": [
                        {
                            "subnet": "2001:db8:1::/64",
                            "pd-pools": [
                                { "prefix": "3001::", "prefix-len": 16, "delegated-len": 96 }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(subnet_dispensable(&ctx).unwrap().is_none());
    }

    #[test]
    fn subnet_with_config_reservation_is_not_dispensable() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "reservations": [
                                { "ip-address": "192.0.3.10", "hw-address": "01:02:03:04:05:06" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(subnet_dispensable(&ctx).unwrap().is_none());
    }

    #[test]
    fn database_reservation_saves_subnet_when_host_cmds_loaded() {
        let db = Db::open_in_memory().unwrap();
        let config_text = r#"{
            "Dhcp4": {
                "subnet4": [ { "id": 111, "subnet": "192.0.3.0/24" } ],
                "hooks-libraries": [
                    { "library": "/usr/lib/kea/libdhcp_host_cmds.so" }
                ]
            }
        }"#;

        // Stand up a daemon serving the subnet with one api-sourced host.
        let daemon_id = {
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
            let subnet_id =
                subnet_store::upsert_subnet(&conn, "192.0.3.0/24", None, &[], &[]).unwrap();
            subnet_store::upsert_local_subnet(&conn, subnet_id, daemon_id, 111).unwrap();
            let host_id = host::upsert_host(
                &conn,
                Some(subnet_id),
                &[host::HostIdentifier::new("hw-address", "01:02:03:04:05:06")],
                None,
                &["192.0.3.50".to_string()],
            )
            .unwrap();
            host::upsert_local_host(&conn, host_id, daemon_id, host::SOURCE_API, &[]).unwrap();
            daemon_id
        };

        let config = KeaConfig::from_json(config_text).unwrap();
        let ctx = ReviewContext::from_config(daemon_id, config, Some(&db));
        assert!(subnet_dispensable(&ctx).unwrap().is_none());

        // Without the hook library the database is not consulted.
        let without_hook = KeaConfig::from_json(
            r#"{ "Dhcp4": { "subnet4": [ { "id": 111, "subnet": "192.0.3.0/24" } ] } }"#,
        )
        .unwrap();
        let ctx = ReviewContext::from_config(daemon_id, without_hook, Some(&db));
        assert!(subnet_dispensable(&ctx).unwrap().is_some());
    }

    #[test]
    fn out_of_pool_reservation_is_recommended() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ],
                            "reservations": [
                                { "hw-address": "01:02:03:04:05:06", "ip-address": "192.0.3.5" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        let report = reservations_out_of_pool(&ctx).unwrap().unwrap();
        assert!(report.content.contains("reservations-out-of-pool"));
        assert!(report.content.contains("1 subnet"));
    }

    #[test]
    fn in_pool_reservation_is_silent() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ],
                            "reservations": [
                                { "hw-address": "01:02:03:04:05:06", "ip-address": "192.0.3.50" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&ctx).unwrap().is_none());
    }

    #[test]
    fn subnet_scope_flag_disables_the_check() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "reservations-out-of-pool": true,
                            "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ],
                            "reservations": [
                                { "hw-address": "01:02:03:04:05:06", "ip-address": "192.0.3.5" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&ctx).unwrap().is_none());
    }

    #[test]
    fn global_and_network_scope_flags_inherit() {
        let global = context(
            r#"{
                "Dhcp4": {
                    "reservations-out-of-pool": true,
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ],
                            "reservations": [
                                { "hw-address": "01:02", "ip-address": "192.0.3.5" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&global).unwrap().is_none());

        let network = context(
            r#"{
                "Dhcp4": {
                    "shared-networks": [
                        {
                            "name": "lily",
                            "reservations-out-of-pool": true,
                            "subnet4": [
                                {
                                    "subnet": "192.0.3.0/24",
                                    "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ],
                                    "reservations": [
                                        { "hw-address": "01:02", "ip-address": "192.0.3.5" }
                                    ]
                                }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&network).unwrap().is_none());
    }

    #[test]
    fn pd_reservations_use_pd_pools() {
        let out = context(
            r#"{
                "Dhcp6": {
                    "subnet6": [
                        {
                            "subnet": "2001:db8:1::/64",
                            "pd-pools": [
                                { "prefix": "3001::", "prefix-len": 16, "delegated-len": 96 }
                            ],
                            "reservations": [
                                { "duid": "01:02", "prefixes": [ "4001::/96" ] }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&out).unwrap().is_some());

        let within = context(
            r#"{
                "Dhcp6": {
                    "subnet6": [
                        {
                            "subnet": "2001:db8:1::/64",
                            "pd-pools": [
                                { "prefix": "3001::", "prefix-len": 16, "delegated-len": 96 }
                            ],
                            "reservations": [
                                { "duid": "01:02", "prefixes": [ "3001:1::/96" ] }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&within).unwrap().is_none());
    }

    #[test]
    fn reservations_without_ip_component_are_ignored() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        {
                            "subnet": "192.0.3.0/24",
                            "pools": [ { "pool": "192.0.3.10 - 192.0.3.100" } ],
                            "reservations": [
                                { "hw-address": "01:02:03:04:05:06", "hostname": "frog" }
                            ]
                        }
                    ]
                }
            }"#,
        );
        assert!(reservations_out_of_pool(&ctx).unwrap().is_none());
    }

    #[test]
    fn overlap_pair_is_reported_with_parent_first() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        { "id": 1, "subnet": "10.0.1.0/24" },
                        { "id": 2, "subnet": "10.0.0.0/16" }
                    ]
                }
            }"#,
        );
        let report = subnets_overlapping(&ctx).unwrap().unwrap();
        assert!(report.content.contains("1 overlapping subnet pair"));
        assert!(report
            .content
            .contains("10.0.0.0/16 is overlapped by 10.0.1.0/24"));
    }

    #[test]
    fn overlaps_across_shared_networks_are_seen() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "shared-networks": [
                        { "name": "lily", "subnet4": [ { "subnet": "10.0.0.0/16" } ] }
                    ],
                    "subnet4": [ { "subnet": "10.0.1.0/24" } ]
                }
            }"#,
        );
        assert!(subnets_overlapping(&ctx).unwrap().is_some());
    }

    #[test]
    fn many_overlaps_are_capped() {
        // 12 identical prefixes produce far more than MAX_OVERLAPS pairs.
        let subnets: Vec<String> = (0..12)
            .map(|i| format!(r#"{{ "id": {}, "subnet": "192.0.2.0/24" }}"#, i + 1))
            .collect();
        let ctx = context(&format!(
            r#"{{ "Dhcp4": {{ "subnet4": [ {} ] }} }}"#,
            subnets.join(", ")
        ));
        let report = subnets_overlapping(&ctx).unwrap().unwrap();
        assert!(report
            .content
            .contains("at least 10 overlapping subnet pairs"));
        assert_eq!(report.content.matches("is overlapped by").count(), 10);
    }

    #[test]
    fn disjoint_subnets_have_no_overlap_report() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        { "subnet": "192.0.2.0/24" },
                        { "subnet": "192.0.3.0/24" }
                    ]
                }
            }"#,
        );
        assert!(subnets_overlapping(&ctx).unwrap().is_none());
    }

    #[test]
    fn canonical_prefixes_lists_expected_forms() {
        let ctx = context(
            r#"{
                "Dhcp6": {
                    "subnet6": [
                        { "subnet": "2001:0000:0000:0000:0000::/64" },
                        { "subnet": "2001:db8::/64" },
                        { "subnet": "frogs" }
                    ]
                }
            }"#,
        );
        let report = canonical_prefixes(&ctx).unwrap().unwrap();
        assert!(report.content.contains("2 subnet prefixes"));
        assert!(report
            .content
            .contains("2001:0000:0000:0000:0000::/64 should be 2001::/64"));
        assert!(report.content.contains("frogs is not a valid prefix"));
    }

    #[test]
    fn canonical_configuration_is_silent() {
        let ctx = context(
            r#"{
                "Dhcp4": {
                    "subnet4": [
                        { "subnet": "192.0.2.0/24" },
                        { "subnet": "10.0.0.0/8" }
                    ]
                }
            }"#,
        );
        assert!(canonical_prefixes(&ctx).unwrap().is_none());
    }
}
