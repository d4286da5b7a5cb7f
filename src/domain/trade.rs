//! Trade event as delivered by the bus and held in the buffer/store.

use crate::domain::{Decimal, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trade event.
///
/// `(partition, offset)` is assigned by the bus and is globally unique per
/// trade; it is the idempotency key for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// BUY or SELL.
    pub side: Side,
    /// Traded volume in MWh, strictly positive.
    pub volume: Decimal,
    /// Execution time.
    pub time: DateTime<Utc>,
    /// Bus partition the event was delivered on.
    pub partition: i32,
    /// Bus offset within the partition.
    pub offset: i64,
}

impl Trade {
    pub fn new(side: Side, volume: Decimal, time: DateTime<Utc>, partition: i32, offset: i64) -> Self {
        Trade {
            side,
            volume,
            time,
            partition,
            offset,
        }
    }

    /// The unique source key of this event on the bus.
    pub fn source_key(&self) -> (i32, i64) {
        (self.partition, self.offset)
    }
}
