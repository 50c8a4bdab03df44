use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// Which directions of a connection's traffic count towards billed usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficCalculationMethod {
    #[default]
    Sum,
    UplinkOnly,
    DownlinkOnly,
}

impl TrafficCalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::UplinkOnly => "uplink_only",
            Self::DownlinkOnly => "downlink_only",
        }
    }

    /// Parses the stored column value. Unknown values fall back to `Sum`.
    pub fn from_db_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "uplink_only" => Self::UplinkOnly,
            "downlink_only" => Self::DownlinkOnly,
            _ => Self::Sum,
        }
    }
}

impl From<&str> for TrafficCalculationMethod {
    fn from(value: &str) -> Self {
        Self::from_db_value(value)
    }
}

impl fmt::Display for TrafficCalculationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-user traffic delta reported by a node since its previous poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatRecord {
    /// Single counter reported by older node versions.
    Legacy { user_id: i64, value: u64 },
    Directional {
        user_id: i64,
        uplink: u64,
        downlink: u64,
    },
}

impl StatRecord {
    pub fn user_id(&self) -> i64 {
        match self {
            Self::Legacy { user_id, .. } | Self::Directional { user_id, .. } => *user_id,
        }
    }

    /// True when the record carries no traffic at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Legacy { value, .. } => *value == 0,
            Self::Directional {
                uplink, downlink, ..
            } => *uplink == 0 && *downlink == 0,
        }
    }
}

/// Stat record as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireStat {
    pub uid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u64>,
    #[serde(default)]
    pub uplink: u64,
    #[serde(default)]
    pub downlink: u64,
}

impl From<WireStat> for StatRecord {
    fn from(stat: WireStat) -> Self {
        match stat.usage {
            Some(value) => StatRecord::Legacy {
                user_id: stat.uid,
                value,
            },
            None => StatRecord::Directional {
                user_id: stat.uid,
                uplink: stat.uplink,
                downlink: stat.downlink,
            },
        }
    }
}

/// Decodes a JSON array of wire stat records.
pub fn parse_stats(body: &[u8]) -> Result<Vec<StatRecord>> {
    let stats: Vec<WireStat> = serde_json::from_slice(body)?;
    Ok(stats.into_iter().map(StatRecord::from).collect())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionalBytes {
    pub uplink: u64,
    pub downlink: u64,
}

impl DirectionalBytes {
    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for DirectionalBytes {
    fn add_assign(&mut self, rhs: Self) {
        self.uplink = self.uplink.saturating_add(rhs.uplink);
        self.downlink = self.downlink.saturating_add(rhs.downlink);
    }
}

/// Bytes counted by `method`, per direction. Legacy values have no direction
/// and are attributed to downlink.
pub fn split(record: &StatRecord, method: TrafficCalculationMethod) -> DirectionalBytes {
    match *record {
        StatRecord::Legacy { value, .. } => DirectionalBytes {
            uplink: 0,
            downlink: value,
        },
        StatRecord::Directional {
            uplink, downlink, ..
        } => match method {
            TrafficCalculationMethod::Sum => DirectionalBytes { uplink, downlink },
            TrafficCalculationMethod::UplinkOnly => DirectionalBytes {
                uplink,
                downlink: 0,
            },
            TrafficCalculationMethod::DownlinkOnly => DirectionalBytes {
                uplink: 0,
                downlink,
            },
        },
    }
}

/// Normalized byte count of a record under the node's calculation method.
pub fn calculate(record: &StatRecord, method: TrafficCalculationMethod) -> u64 {
    split(record, method).total()
}
