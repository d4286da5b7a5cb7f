//! Market interval as delivered on the `market` topic.

use crate::domain::{to_epoch_ms, Decimal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A market interval: a time window with the buy and sell prices at which
/// trades inside the window settle.
///
/// `(start_time, end_time)` is unique (store-enforced), and so is
/// `(partition, offset)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketInterval {
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub partition: i32,
    pub offset: i64,
}

impl MarketInterval {
    /// The `(start, end)` pair in epoch milliseconds: the idempotency key
    /// for duplicate detection, matching the store's unique interval index.
    pub fn interval_key(&self) -> (i64, i64) {
        (to_epoch_ms(self.start_time), to_epoch_ms(self.end_time))
    }

    /// The unique source key of this event on the bus.
    pub fn source_key(&self) -> (i32, i64) {
        (self.partition, self.offset)
    }
}
