//! Repeat-offender subnet clustering
//!
//! Every pair of qualifying addresses is compared octet by octet. Pairs whose
//! first difference is in the fourth octet share a /24, pairs differing first
//! in the third octet share a /16. Each prefix group with two or more members
//! gets the smallest power-of-two block estimated from the spread of its
//! varying octet:
//!
//! ```text
//! 192.168.1.1, 192.168.1.26, 192.168.1.30
//!   range = 30 - 1 = 29, round(log2 29) = 5, block = 32
//!   -> 192.168.1.0/27, netmask 255.255.255.224, 30 hosts
//! ```

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::SubnetCluster;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OctetError {
    #[error("{ip:?} has {count} octets, expected 4")]
    WrongOctetCount { ip: String, count: usize },

    #[error("{ip:?} has invalid octet {octet:?}")]
    InvalidOctet { ip: String, octet: String },
}

/// Split a dotted-decimal IPv4 string into its four octets
pub fn parse_octets(ip: &str) -> Result<[u8; 4], OctetError> {
    let parts: Vec<&str> = ip.trim().split('.').collect();
    if parts.len() != 4 {
        return Err(OctetError::WrongOctetCount {
            ip: ip.to_string(),
            count: parts.len(),
        });
    }

    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        *slot = part.parse().map_err(|_| OctetError::InvalidOctet {
            ip: ip.to_string(),
            octet: part.to_string(),
        })?;
    }
    Ok(octets)
}

/// How much of a network prefix two addresses share
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrefixRelation {
    /// First octet differs
    Unrelated,
    Shared8,
    Shared16,
    Shared24,
    /// Same address
    Identical,
}

impl PrefixRelation {
    /// Number of shared leading bits (0, 8, 16, 24 or 32)
    pub fn code(&self) -> u8 {
        match self {
            PrefixRelation::Unrelated => 0,
            PrefixRelation::Shared8 => 8,
            PrefixRelation::Shared16 => 16,
            PrefixRelation::Shared24 => 24,
            PrefixRelation::Identical => 32,
        }
    }
}

pub fn compare_octets(a: &[u8; 4], b: &[u8; 4]) -> PrefixRelation {
    match a.iter().zip(b).position(|(x, y)| x != y) {
        Some(0) => PrefixRelation::Unrelated,
        Some(1) => PrefixRelation::Shared8,
        Some(2) => PrefixRelation::Shared16,
        Some(_) => PrefixRelation::Shared24,
        None => PrefixRelation::Identical,
    }
}

/// The fixed leading octets a candidate group is keyed by.
/// /16 groups order before /24 groups so finer clusters are applied last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupPrefix {
    Slash16([u8; 2]),
    Slash24([u8; 3]),
}

impl GroupPrefix {
    fn of(relation: PrefixRelation, octets: &[u8; 4]) -> Option<Self> {
        match relation {
            PrefixRelation::Shared16 => Some(GroupPrefix::Slash16([octets[0], octets[1]])),
            PrefixRelation::Shared24 => {
                Some(GroupPrefix::Slash24([octets[0], octets[1], octets[2]]))
            }
            _ => None,
        }
    }

    pub fn base_bits(&self) -> u32 {
        match self {
            GroupPrefix::Slash16(_) => 16,
            GroupPrefix::Slash24(_) => 24,
        }
    }

    /// The octet that varies among the group's members
    pub fn varying_octet(&self, octets: &[u8; 4]) -> u8 {
        match self {
            GroupPrefix::Slash16(_) => octets[2],
            GroupPrefix::Slash24(_) => octets[3],
        }
    }

    fn netmask(&self, mask_octet: u32) -> String {
        match self {
            GroupPrefix::Slash16(_) => format!("255.255.{}.0", mask_octet),
            GroupPrefix::Slash24(_) => format!("255.255.255.{}", mask_octet),
        }
    }

    fn network_address(&self, boundary: u32) -> String {
        match self {
            GroupPrefix::Slash16([a, b]) => format!("{}.{}.{}.0", a, b, boundary),
            GroupPrefix::Slash24([a, b, c]) => format!("{}.{}.{}.{}", a, b, c, boundary),
        }
    }
}

impl std::fmt::Display for GroupPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupPrefix::Slash16([a, b]) => write!(f, "{}.{}/16", a, b),
            GroupPrefix::Slash24([a, b, c]) => write!(f, "{}.{}.{}/24", a, b, c),
        }
    }
}

/// Smallest block around the spread of `varying`, `None` when every member
/// has the same varying octet.
pub fn estimate_subnet<I>(prefix: GroupPrefix, varying: I) -> Option<SubnetCluster>
where
    I: IntoIterator<Item = u8>,
{
    let (min, max) = varying
        .into_iter()
        .fold(None, |acc: Option<(u8, u8)>, v| match acc {
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            None => Some((v, v)),
        })?;

    let range = max - min;
    if range == 0 {
        return None;
    }

    // 1..=255 -> 0..=8
    let exponent = f64::from(range).log2().round() as u32;
    let subnet_size = 1u32 << exponent;
    let cidr_bits = prefix.base_bits() + (8 - exponent);
    let host_count = (1u32 << (32 - cidr_bits)).saturating_sub(2);
    let boundary = (u32::from(min) / subnet_size) * subnet_size;

    Some(SubnetCluster {
        id: None,
        subnet_id: prefix.network_address(boundary),
        cidr: format!("/{}", cidr_bits),
        netmask: prefix.netmask(256 - subnet_size),
        host_count,
    })
}

/// A materialized cluster and the addresses it was derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterResult {
    pub prefix: GroupPrefix,
    pub subnet: SubnetCluster,
    pub members: Vec<String>,
}

/// Group qualifying addresses by shared /24 and /16 prefixes and derive a
/// subnet for every group of two or more. Malformed addresses are dropped
/// from the pass with a warning.
pub fn find_clusters<S: AsRef<str>>(ips: &[S]) -> Vec<ClusterResult> {
    let parsed: Vec<(&str, [u8; 4])> = ips
        .iter()
        .filter_map(|ip| {
            let ip = ip.as_ref();
            match parse_octets(ip) {
                Ok(octets) => Some((ip, octets)),
                Err(e) => {
                    warn!("Excluding address from subnet clustering: {}", e);
                    None
                }
            }
        })
        .collect();

    // prefix -> member ip -> octets
    let mut groups: BTreeMap<GroupPrefix, BTreeMap<&str, [u8; 4]>> = BTreeMap::new();

    for (i, (ip_a, a)) in parsed.iter().enumerate() {
        for (ip_b, b) in &parsed[i + 1..] {
            let relation = compare_octets(a, b);
            if let Some(prefix) = GroupPrefix::of(relation, a) {
                let members = groups.entry(prefix).or_default();
                members.insert(*ip_a, *a);
                members.insert(*ip_b, *b);
            }
        }
    }

    let mut clusters = Vec::new();
    for (prefix, members) in groups {
        if members.len() < 2 {
            continue;
        }

        let varying = members.values().map(|o| prefix.varying_octet(o));
        match estimate_subnet(prefix, varying) {
            Some(subnet) => {
                debug!(
                    "Group {} ({} members) -> {}{}",
                    prefix,
                    members.len(),
                    subnet.subnet_id,
                    subnet.cidr
                );
                clusters.push(ClusterResult {
                    prefix,
                    subnet,
                    members: members.keys().map(|ip| ip.to_string()).collect(),
                });
            }
            None => debug!("Group {} has no spread, skipping", prefix),
        }
    }

    clusters
}
