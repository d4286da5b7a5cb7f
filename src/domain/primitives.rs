//! Domain primitives: trade side and epoch-millisecond conversions.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Trade side: BUY adds volume to the position, SELL subtracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse from the wire/store representation ("BUY" / "SELL").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Convert an instant to epoch milliseconds (the at-rest representation).
pub fn to_epoch_ms(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert epoch milliseconds back to an instant.
///
/// Millisecond timestamps written by this system are always representable;
/// out-of-range values indicate store corruption and map to the epoch.
pub fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}
