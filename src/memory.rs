//! Trade memory buffer: bounded-retention, append-heavy, range-queryable.
//!
//! Trades arrive roughly chronologically per partition, so the buffer is an
//! append-ordered deque and the retention sweep front-trims while the head is
//! older than the cutoff. A single merged "queried range" tracks what callers
//! have already asked for, flagging late arrivals that land inside it.

use crate::domain::Trade;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// A trade arrived inside the already-queried window; its interval's PnL may
/// have been computed without it. Detection only: a future reconciliation
/// publisher consumes this, no recompute happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateArrival {
    pub trade_time: DateTime<Utc>,
    pub queried_start: DateTime<Utc>,
    pub queried_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueriedRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// In-memory trade buffer with time-based retention.
#[derive(Debug)]
pub struct TradeMemory {
    trades: VecDeque<Trade>,
    last_trade_time: Option<DateTime<Utc>>,
    queried: Option<QueriedRange>,
    retention: Duration,
    queried_retention: Duration,
}

impl TradeMemory {
    pub fn new(retention_ms: i64, queried_range_retention_ms: i64) -> Self {
        TradeMemory {
            trades: VecDeque::new(),
            last_trade_time: None,
            queried: None,
            retention: Duration::milliseconds(retention_ms),
            queried_retention: Duration::milliseconds(queried_range_retention_ms),
        }
    }

    /// Append a trade and advance `last_trade_time`.
    ///
    /// Returns a [`LateArrival`] when the trade lands inside the current
    /// merged queried range (non-fatal; the caller logs it).
    pub fn add(&mut self, trade: Trade) -> Option<LateArrival> {
        let trade_time = trade.time;
        let late = self
            .queried
            .filter(|range| trade_time >= range.start && trade_time <= range.end);

        self.last_trade_time = Some(match self.last_trade_time {
            Some(last) => last.max(trade_time),
            None => trade_time,
        });
        self.trades.push_back(trade);

        late.map(|range| LateArrival {
            trade_time,
            queried_start: range.start,
            queried_end: range.end,
        })
    }

    /// All buffered trades with `start <= time <= end`, both ends inclusive.
    pub fn query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Trade> {
        self.trades
            .iter()
            .filter(|t| t.time >= start && t.time <= end)
            .cloned()
            .collect()
    }

    /// Whether any buffered trade falls inside `[start, end]`.
    pub fn has_any(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.trades
            .iter()
            .any(|t| t.time >= start && t.time <= end)
    }

    /// The latest trade time ever observed (monotonically non-decreasing).
    pub fn last_trade_time(&self) -> Option<DateTime<Utc>> {
        self.last_trade_time
    }

    /// Merge `[start, end]` into the single queried range.
    ///
    /// The range's end grows monotonically; its start only moves backward
    /// when the new start is still inside the queried-range retention
    /// window, and is always advanced forward to `now - retention`.
    pub fn update_queried_range(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let cutoff = now - self.queried_retention;
        let merged = match self.queried {
            Some(range) => QueriedRange {
                start: range.start.min(start).max(cutoff),
                end: range.end.max(end),
            },
            None => QueriedRange {
                start: start.max(cutoff),
                end,
            },
        };
        self.queried = Some(merged);
    }

    /// Drop trades older than `now - retention`. Front-trim: stops at the
    /// first young-enough entry, exploiting approximate time ordering.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some(front) = self.trades.front() {
            if front.time < cutoff {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of buffered trades.
    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }
}
