//! Trade range-query router: answer from the memory buffer when it has
//! hits, otherwise delegate to the persistence range-query RPC.
//!
//! A market interval `[a, b]` can be delivered milliseconds after `b` while
//! trades with `time` inside `[a, b]` are still in flight. Before answering
//! from memory the router waits, bounded, for the buffer to observe a trade
//! strictly after `b`, a strong empirical signal that all in-period trades
//! have been buffered.

use crate::domain::Trade;
use crate::memory::TradeMemory;
use crate::pipeline::{HistoryError, TradeHistory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// The range-query router (memory first, store second).
pub struct TradeRouter {
    memory: Arc<Mutex<TradeMemory>>,
    history: Arc<dyn TradeHistory>,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl TradeRouter {
    pub fn new(
        memory: Arc<Mutex<TradeMemory>>,
        history: Arc<dyn TradeHistory>,
        wait_timeout: Duration,
    ) -> Self {
        TradeRouter {
            memory,
            history,
            wait_timeout,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Override the bounded-wait polling interval (tests).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Trades with `start <= time <= end`.
    ///
    /// Persistence-side failures are swallowed: the caller may see missing
    /// trades as a zero-PnL interval rather than a failed one.
    pub async fn get_trades_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Trade> {
        let (last_seen, memory_has_hits) = {
            let mut memory = self.memory.lock().await;
            memory.update_queried_range(start, end, Utc::now());
            (memory.last_trade_time(), memory.has_any(start, end))
        };

        if memory_has_hits {
            self.wait_for_trade_after(last_seen, end).await;
            return self.memory.lock().await.query(start, end);
        }

        match tokio::time::timeout(
            self.wait_timeout,
            self.history.trades_for_period(start, end),
        )
        .await
        {
            Ok(Ok(trades)) => trades,
            Ok(Err(e)) => {
                warn!(error = %e, "Trade history query failed, answering with no trades");
                Vec::new()
            }
            Err(_) => {
                warn!("Trade history query exceeded deadline, answering with no trades");
                Vec::new()
            }
        }
    }

    /// Poll until the buffer observes a trade strictly after `end`, up to
    /// the wait timeout. Returns immediately when the watermark is already
    /// past `end`.
    async fn wait_for_trade_after(&self, baseline: Option<DateTime<Utc>>, end: DateTime<Utc>) {
        if baseline.map_or(false, |t| t > end) {
            return;
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let observed = self.memory.lock().await.last_trade_time();
            if observed != baseline && observed.map_or(false, |t| t > end) {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
        }
    }
}

#[async_trait]
impl TradeHistory for TradeRouter {
    /// Router-as-source for the calculation pipeline; by design this never
    /// errors (unavailability degrades to an empty answer).
    async fn trades_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, HistoryError> {
        Ok(self.get_trades_for_period(start, end).await)
    }
}
