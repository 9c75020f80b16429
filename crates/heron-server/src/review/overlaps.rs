//! Subnet prefix overlap detection.
//!
//! Each prefix converts to its fixed-length binary form padded to 128
//! bits plus a family tag. Entries sort by
//! `(family, network bits, prefix length)` so containing prefixes
//! precede contained ones; a sweep then compares each entry against the
//! previous entries whose mask covers it. Equal prefixes are reported as
//! two mutually-referential pairs. The pair cap is an upper bound on the
//! total across families; IPv6 is processed first and the output is
//! ordered by `(family desc, parent id desc, child id asc)`.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use heron_common::addr::Family;

/// One side of an overlap pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRef {
    pub id: i64,
    pub prefix: String,
}

/// `parent` contains (or equals) `child`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapPair {
    pub parent: SubnetRef,
    pub child: SubnetRef,
}

struct BinaryPrefix {
    id: i64,
    prefix: String,
    family: Family,
    /// Network bits left-aligned in 128 bits.
    bits: u128,
    len: u8,
}

fn to_binary(id: i64, prefix: &str) -> Option<BinaryPrefix> {
    let net = IpNet::from_str(prefix).ok()?.trunc();
    let (bits, len) = match net.network() {
        IpAddr::V4(addr) => (
            (u128::from(u32::from(addr))) << 96,
            net.prefix_len(),
        ),
        IpAddr::V6(addr) => (u128::from(addr), net.prefix_len()),
    };
    Some(BinaryPrefix {
        id,
        prefix: prefix.to_string(),
        family: Family::of(prefix),
        bits,
        len,
    })
}

fn mask(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - len)
    }
}

/// Detect overlapping prefixes among `(id, prefix)` pairs, up to `limit`
/// total pairs. Unparseable prefixes are ignored.
pub fn find_overlaps(subnets: &[(i64, String)], limit: usize) -> Vec<OverlapPair> {
    let mut pairs = Vec::new();

    // IPv6 first: when the cap binds, IPv4 pairs are dropped first.
    for family in [Family::V6, Family::V4] {
        if pairs.len() >= limit {
            break;
        }
        let mut entries: Vec<BinaryPrefix> = subnets
            .iter()
            .filter(|(_, prefix)| Family::of(prefix) == family)
            .filter_map(|(id, prefix)| to_binary(*id, prefix))
            .collect();
        entries.sort_by(|a, b| {
            a.bits
                .cmp(&b.bits)
                .then(a.len.cmp(&b.len))
                .then(a.id.cmp(&b.id))
        });

        'sweep: for current in 1..entries.len() {
            for previous in (0..current).rev() {
                let parent = &entries[previous];
                let child = &entries[current];
                if parent.len > child.len {
                    continue;
                }
                if parent.bits & mask(parent.len) != child.bits & mask(parent.len) {
                    continue;
                }
                pairs.push(OverlapPair {
                    parent: SubnetRef {
                        id: parent.id,
                        prefix: parent.prefix.clone(),
                    },
                    child: SubnetRef {
                        id: child.id,
                        prefix: child.prefix.clone(),
                    },
                });
                // Equal prefixes overlap mutually.
                if parent.len == child.len {
                    pairs.push(OverlapPair {
                        parent: SubnetRef {
                            id: child.id,
                            prefix: child.prefix.clone(),
                        },
                        child: SubnetRef {
                            id: parent.id,
                            prefix: parent.prefix.clone(),
                        },
                    });
                }
                if pairs.len() >= limit {
                    break 'sweep;
                }
            }
        }
    }

    pairs.truncate(limit);
    pairs.sort_by(|a, b| {
        let family_a = Family::of(&a.parent.prefix);
        let family_b = Family::of(&b.parent.prefix);
        family_b
            .cmp(&family_a)
            .then(b.parent.id.cmp(&a.parent.id))
            .then(a.child.id.cmp(&b.child.id))
    });
    pairs
}
