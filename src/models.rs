use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Marker stored for a location field the geolocation service had no value for
pub const UNKNOWN_LOCATION: &str = "-";

/// Storage format for event timestamps (second resolution, no zone)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A rejected ssh login extracted from an auth log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakinAttempt {
    pub timestamp: NaiveDateTime,
    pub source_ip: String,
    pub username: Option<String>,
}

/// The ip/username half of an attempt, keyed by its timestamp in the accumulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptDetails {
    pub source_ip: String,
    pub username: Option<String>,
}

/// A fail2ban ban notice
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BanEvent {
    pub timestamp: NaiveDateTime,
    pub source_ip: String,
}

/// A stored offending address. Attempts, bans and subnets refer to it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRecord {
    pub id: i64,
    pub ip: String,
    pub region: Option<String>,
    pub country: Option<String>,
    pub subnet_ref: Option<i64>,
}

impl IpRecord {
    /// Human readable location, as much of it as is known
    pub fn location(&self) -> String {
        let known = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.is_empty() && *s != UNKNOWN_LOCATION)
                .map(str::to_string)
        };

        match (known(&self.region), known(&self.country)) {
            (Some(region), Some(country)) => format!("{}, {}", region, country),
            (None, Some(country)) => country,
            (Some(region), None) => region,
            (None, None) => UNKNOWN_LOCATION.to_string(),
        }
    }
}

/// A derived network block shared by repeat offenders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetCluster {
    pub id: Option<i64>,
    /// Network address, e.g. "192.168.1.0"
    pub subnet_id: String,
    /// Suffix including the slash, e.g. "/27"
    pub cidr: String,
    pub netmask: String,
    pub host_count: u32,
}

/// Best-effort location for an address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub region: Option<String>,
    pub country: Option<String>,
}

/// Per-IP aggregate used by the `offenders` listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffenderSummary {
    pub ip: String,
    pub attempts: u32,
    pub bans: u32,
    pub location: String,
    pub subnet: Option<String>,
}

/// Outcome of one full run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub files_scanned: usize,
    pub attempts_found: usize,
    pub bans_found: usize,
    pub new_ips: usize,
    pub attempts_inserted: usize,
    pub bans_inserted: usize,
    pub subnets_found: usize,
    pub subnets_created: usize,
}
