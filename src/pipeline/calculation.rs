//! Calculation pipeline: consume the `market` topic, join each interval
//! against its trades, write market+PnL atomically, and commit offsets in
//! order per partition while intervals process concurrently.

use crate::bus::messages::parse_market;
use crate::bus::{BusConsumer, Delivery};
use crate::db::{MarketWrite, Repository};
use crate::domain::{Decimal, MarketInterval, PnlRecord};
use crate::pipeline::commit::CommitTracker;
use crate::pipeline::{HistoryError, TradeHistory};
use crate::retry::{retry_with_backoff, RetryPolicy};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_SLICE: Duration = Duration::from_millis(200);

/// Bounded FIFO of recently processed intervals, keyed by
/// `(start_ms, end_ms)`. First line of the idempotency check, ahead of the
/// store lookup.
#[derive(Debug)]
pub struct RecentIntervals {
    capacity: usize,
    order: VecDeque<(i64, i64)>,
    seen: HashSet<(i64, i64)>,
}

impl RecentIntervals {
    pub fn new(capacity: usize) -> Self {
        RecentIntervals {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, key: (i64, i64)) -> bool {
        self.seen.contains(&key)
    }

    pub fn insert(&mut self, key: (i64, i64)) {
        if self.seen.contains(&key) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// How an interval was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketOutcome {
    /// PnL computed and both records written by this call.
    Processed,
    /// Interval already durably processed; nothing written.
    Skipped,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("trade fetch failed: {0}")]
    Trades(#[from] HistoryError),
}

/// The calculation service (consumer group `calculation-service-group`).
pub struct CalculationService {
    consumer: Arc<dyn BusConsumer>,
    repo: Repository,
    trades: Arc<dyn TradeHistory>,
    fee: Decimal,
    tracker: Mutex<CommitTracker>,
    recent: Mutex<RecentIntervals>,
    retry_policy: RetryPolicy,
}

impl CalculationService {
    pub fn new(
        consumer: Arc<dyn BusConsumer>,
        repo: Repository,
        trades: Arc<dyn TradeHistory>,
        fee: Decimal,
        market_buffer_size: usize,
    ) -> Self {
        CalculationService {
            consumer,
            repo,
            trades,
            fee,
            tracker: Mutex::new(CommitTracker::new()),
            recent: Mutex::new(RecentIntervals::new(market_buffer_size)),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Override the trade-fetch retry schedule (tests).
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Consume until cancelled. The bus loop never blocks on processing: it
    /// registers the offset, spawns the per-interval task, and returns to
    /// polling. In-flight tasks are drained before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        while !cancel.is_cancelled() {
            match self.consumer.poll(POLL_SLICE).await {
                Ok(Some(delivery)) => self.handle_delivery(delivery, &mut tasks).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Market consumer poll failed");
                    tokio::time::sleep(POLL_SLICE).await;
                }
            }
            // Reap finished tasks so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        info!("Calculation service stopped");
    }

    async fn handle_delivery(self: &Arc<Self>, delivery: Delivery, tasks: &mut JoinSet<()>) {
        let partition = delivery.partition;
        let offset = delivery.offset;

        let market = match parse_market(&delivery.payload, partition, offset) {
            Ok(market) => market,
            Err(e) => {
                warn!(
                    partition,
                    offset,
                    error = %e,
                    "[DLQ] Dropping malformed market message"
                );
                // The offset still occupies its slot in the ordered chain.
                let mut tracker = self.tracker.lock().await;
                tracker.complete(partition, offset);
                self.drain_commits(&mut tracker, partition).await;
                return;
            }
        };

        {
            let mut tracker = self.tracker.lock().await;
            if !tracker.begin(partition, offset) {
                debug!(partition, offset, "Duplicate delivery while in flight, skipping");
                return;
            }
        }

        let service = self.clone();
        tasks.spawn(async move {
            service.process_and_complete(market).await;
        });
    }

    async fn process_and_complete(self: Arc<Self>, market: MarketInterval) {
        let (partition, offset) = market.source_key();

        match self.process_market(&market).await {
            Ok(outcome) => {
                debug!(partition, offset, ?outcome, "Interval processed");
                let mut tracker = self.tracker.lock().await;
                tracker.complete(partition, offset);
                self.drain_commits(&mut tracker, partition).await;
            }
            Err(e) => {
                // Leave the offset out of both in-flight and completed; the
                // message is redelivered after a rebalance or restart.
                warn!(
                    partition,
                    offset,
                    error = %e,
                    "Interval processing failed, awaiting redelivery"
                );
                self.tracker.lock().await.abandon(partition, offset);
            }
        }
    }

    /// Process one market interval: idempotency check, trade fetch, PnL
    /// computation, atomic write.
    pub async fn process_market(
        &self,
        market: &MarketInterval,
    ) -> Result<MarketOutcome, ProcessError> {
        let key = market.interval_key();

        if self.recent.lock().await.contains(key) {
            return Ok(MarketOutcome::Skipped);
        }
        if self
            .repo
            .market_exists(market.start_time, market.end_time)
            .await?
        {
            self.recent.lock().await.insert(key);
            return Ok(MarketOutcome::Skipped);
        }

        let trades = retry_with_backoff(self.retry_policy, "fetch trades for interval", || {
            self.trades
                .trades_for_period(market.start_time, market.end_time)
        })
        .await?;

        let pnl = PnlRecord::compute(market, &trades, self.fee, Utc::now());
        let write = self.repo.insert_market_with_pnl(market, &pnl).await?;
        self.recent.lock().await.insert(key);

        match write {
            MarketWrite::Inserted => {
                info!(
                    start = %market.start_time,
                    end = %market.end_time,
                    pnl = %pnl.pnl,
                    trades = trades.len(),
                    "PnL record written"
                );
                Ok(MarketOutcome::Processed)
            }
            MarketWrite::AlreadyExists => Ok(MarketOutcome::Skipped),
        }
    }

    /// Commit every offset that is next in the ordered chain. A failed
    /// commit is transient: stop and retry on the next completion.
    async fn drain_commits(&self, tracker: &mut CommitTracker, partition: i32) {
        while let Some(next) = tracker.next_committable(partition) {
            match self.consumer.commit(partition, next + 1).await {
                Ok(()) => tracker.mark_committed(partition, next),
                Err(e) => {
                    warn!(partition, offset = next, error = %e, "Offset commit failed, will retry");
                    break;
                }
            }
        }
    }
}
