//! Trade persistence pipeline: consume the `trades` topic, batch writes on a
//! timer, commit offsets under the loose highest-per-partition policy.
//!
//! Loose commit rationale: if offsets 10..20 were in a batch and 15 silently
//! failed, committing 21 means 15 is never redelivered. Accepted: bulk-write
//! failures are rare and the store is reconciled externally. The
//! highest-offset-per-partition rule keeps the commit map O(partitions).

use crate::bus::messages::parse_trade;
use crate::bus::{BusConsumer, Delivery};
use crate::db::Repository;
use crate::domain::Trade;
use crate::pipeline::{HistoryError, TradeHistory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound on a single consumer poll, keeping the loop responsive to
/// shutdown and to the batch timer.
const POLL_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct PendingBatch {
    trades: Vec<Trade>,
    highest_offset: HashMap<i32, i64>,
}

impl PendingBatch {
    fn push(&mut self, trade: Trade) {
        let entry = self
            .highest_offset
            .entry(trade.partition)
            .or_insert(trade.offset);
        if trade.offset > *entry {
            *entry = trade.offset;
        }
        self.trades.push(trade);
    }

    fn take(&mut self) -> (Vec<Trade>, HashMap<i32, i64>) {
        (
            std::mem::take(&mut self.trades),
            std::mem::take(&mut self.highest_offset),
        )
    }

    fn restore(&mut self, trades: Vec<Trade>, highest: HashMap<i32, i64>) {
        let tail = std::mem::take(&mut self.trades);
        self.trades = trades;
        self.trades.extend(tail);
        for (partition, offset) in highest {
            let entry = self.highest_offset.entry(partition).or_insert(offset);
            if offset > *entry {
                *entry = offset;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }
}

/// What a flush did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed_rows: usize,
    pub committed: bool,
}

/// The trade persistence service (consumer group
/// `trade-persistence-service-group`).
pub struct PersistenceService {
    consumer: Arc<dyn BusConsumer>,
    repo: Repository,
    batch_interval: Duration,
}

impl PersistenceService {
    pub fn new(consumer: Arc<dyn BusConsumer>, repo: Repository, batch_interval: Duration) -> Self {
        PersistenceService {
            consumer,
            repo,
            batch_interval,
        }
    }

    /// Consume until cancelled, flushing every `batch_interval`. Runs one
    /// final flush (which may commit) before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut batch = PendingBatch::default();
        let mut next_flush = Instant::now() + self.batch_interval;

        while !cancel.is_cancelled() {
            let until_flush = next_flush.saturating_duration_since(Instant::now());
            match self.consumer.poll(until_flush.min(POLL_SLICE)).await {
                Ok(Some(delivery)) => self.ingest(&mut batch, delivery),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Trade consumer poll failed");
                    tokio::time::sleep(POLL_SLICE).await;
                }
            }

            if Instant::now() >= next_flush {
                self.flush(&mut batch).await;
                next_flush = Instant::now() + self.batch_interval;
            }
        }

        // Shutdown: drain what is pending before closing.
        self.flush(&mut batch).await;
        info!("Persistence service stopped");
    }

    fn ingest(&self, batch: &mut PendingBatch, delivery: Delivery) {
        match parse_trade(&delivery.payload, delivery.partition, delivery.offset) {
            Ok(trade) => batch.push(trade),
            Err(e) => {
                warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "[DLQ] Dropping malformed trade message"
                );
            }
        }
    }

    /// Flush the pending batch per the loose-commit decision table.
    async fn flush(&self, batch: &mut PendingBatch) -> FlushReport {
        if batch.is_empty() {
            return FlushReport {
                flushed: 0,
                failed_rows: 0,
                committed: false,
            };
        }

        let (to_flush, highest) = batch.take();
        let count = to_flush.len();

        let outcome = match self.repo.upsert_trades_batch(&to_flush).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, count, "Trade batch write failed, restoring batch");
                batch.restore(to_flush, highest);
                return FlushReport {
                    flushed: 0,
                    failed_rows: count,
                    committed: false,
                };
            }
        };

        if outcome.failed > 0 {
            warn!(
                failed = outcome.failed,
                successful = outcome.successful(),
                "Partial bulk-write failure"
            );
        }

        if outcome.successful() == 0 {
            // Nothing landed: keep everything for the next attempt, do not
            // move offsets.
            batch.restore(to_flush, highest);
            return FlushReport {
                flushed: 0,
                failed_rows: outcome.failed,
                committed: false,
            };
        }

        // At least one row is durable: commit highest+1 per partition. Rows
        // that failed will reappear on redelivery and upsert idempotently.
        let mut commit_failed = false;
        for (partition, offset) in &highest {
            if let Err(e) = self.consumer.commit(*partition, offset + 1).await {
                warn!(
                    partition = *partition,
                    error = %e,
                    "Offset commit failed, restoring batch for retry"
                );
                commit_failed = true;
                break;
            }
        }
        if commit_failed {
            batch.restore(to_flush, highest);
            return FlushReport {
                flushed: count,
                failed_rows: outcome.failed,
                committed: false,
            };
        }

        info!(
            flushed = count,
            upserted = outcome.upserted,
            matched = outcome.matched,
            failed = outcome.failed,
            "Trade batch flushed"
        );
        FlushReport {
            flushed: count,
            failed_rows: outcome.failed,
            committed: true,
        }
    }
}

/// Store-backed trade history: the persistence side of the range-query RPC.
#[derive(Clone)]
pub struct StoreTradeHistory {
    repo: Repository,
}

impl StoreTradeHistory {
    pub fn new(repo: Repository) -> Self {
        StoreTradeHistory { repo }
    }
}

#[async_trait]
impl TradeHistory for StoreTradeHistory {
    async fn trades_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, HistoryError> {
        Ok(self.repo.query_trades_in_range(start, end).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::messages::TradeMessage;
    use crate::bus::{BusError, InProcessBus, BusProducer, TRADES_TOPIC, TRADE_PERSISTENCE_GROUP};
    use crate::db::init_db;
    use crate::domain::{Decimal, Side};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    async fn setup_repo() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }

    fn trade_payload(volume: &str, time_ms: i64) -> Vec<u8> {
        TradeMessage::new(
            Side::Buy,
            Decimal::from_str_canonical(volume).unwrap(),
            Utc.timestamp_millis_opt(time_ms).unwrap(),
        )
        .to_payload()
    }

    fn delivery(partition: i32, offset: i64, payload: Vec<u8>) -> Delivery {
        Delivery {
            partition,
            offset,
            payload,
        }
    }

    #[tokio::test]
    async fn test_flush_writes_and_commits_highest_plus_one() {
        let (repo, _temp) = setup_repo().await;
        let bus = InProcessBus::new(2);
        let consumer = Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await);
        let service =
            PersistenceService::new(consumer, repo.clone(), Duration::from_secs(10));

        let mut batch = PendingBatch::default();
        service.ingest(&mut batch, delivery(0, 0, trade_payload("1", 1_000)));
        service.ingest(&mut batch, delivery(0, 1, trade_payload("2", 2_000)));
        service.ingest(&mut batch, delivery(1, 4, trade_payload("3", 3_000)));

        let report = service.flush(&mut batch).await;
        assert!(report.committed);
        assert_eq!(report.flushed, 3);
        assert_eq!(repo.count_trades().await.unwrap(), 3);
        assert_eq!(
            bus.committed_offset(TRADE_PERSISTENCE_GROUP, TRADES_TOPIC, 0)
                .await,
            Some(2)
        );
        assert_eq!(
            bus.committed_offset(TRADE_PERSISTENCE_GROUP, TRADES_TOPIC, 1)
                .await,
            Some(5)
        );
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (repo, _temp) = setup_repo().await;
        let bus = InProcessBus::new(1);
        let consumer = Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await);
        let service = PersistenceService::new(consumer, repo.clone(), Duration::from_secs(10));

        let mut batch = PendingBatch::default();
        service.ingest(&mut batch, delivery(0, 0, b"not json".to_vec()));
        service.ingest(
            &mut batch,
            delivery(0, 1, br#"{"messageType":"trades","tradeType":"BUY","volume":"-5","time":"2024-01-01T00:00:00Z"}"#.to_vec()),
        );
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (repo, _temp) = setup_repo().await;
        let bus = InProcessBus::new(1);
        let consumer = Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await);
        let service = PersistenceService::new(consumer, repo, Duration::from_secs(10));

        let mut batch = PendingBatch::default();
        let report = service.flush(&mut batch).await;
        assert!(!report.committed);
        assert_eq!(report.flushed, 0);
        assert_eq!(
            bus.committed_offset(TRADE_PERSISTENCE_GROUP, TRADES_TOPIC, 0)
                .await,
            None
        );
    }

    /// Consumer wrapper whose commits can be forced to fail.
    struct FlakyCommitConsumer {
        inner: Arc<dyn BusConsumer>,
        fail_commits: AtomicBool,
    }

    #[async_trait]
    impl BusConsumer for FlakyCommitConsumer {
        async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
            self.inner.poll(timeout).await
        }

        async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), BusError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(BusError::Commit("injected".to_string()));
            }
            self.inner.commit(partition, next_offset).await
        }
    }

    #[tokio::test]
    async fn test_commit_failure_restores_batch() {
        let (repo, _temp) = setup_repo().await;
        let bus = InProcessBus::new(1);
        let inner: Arc<dyn BusConsumer> =
            Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await);
        let flaky = Arc::new(FlakyCommitConsumer {
            inner,
            fail_commits: AtomicBool::new(true),
        });
        let service =
            PersistenceService::new(flaky.clone(), repo.clone(), Duration::from_secs(10));

        let mut batch = PendingBatch::default();
        service.ingest(&mut batch, delivery(0, 0, trade_payload("1", 1_000)));

        let report = service.flush(&mut batch).await;
        assert!(!report.committed);
        assert!(!batch.is_empty(), "batch must be restored for retry");
        assert_eq!(
            bus.committed_offset(TRADE_PERSISTENCE_GROUP, TRADES_TOPIC, 0)
                .await,
            None
        );

        // Next flush succeeds and the duplicate upsert is idempotent.
        flaky.fail_commits.store(false, Ordering::SeqCst);
        let report = service.flush(&mut batch).await;
        assert!(report.committed);
        assert_eq!(repo.count_trades().await.unwrap(), 1);
        assert_eq!(
            bus.committed_offset(TRADE_PERSISTENCE_GROUP, TRADES_TOPIC, 0)
                .await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_run_consumes_and_flushes_from_bus() {
        let (repo, _temp) = setup_repo().await;
        let bus = InProcessBus::new(2);
        for i in 0..4 {
            bus.publish(TRADES_TOPIC, trade_payload("1", 1_000 + i))
                .await
                .unwrap();
        }

        let consumer = Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await);
        let service = Arc::new(PersistenceService::new(
            consumer,
            repo.clone(),
            Duration::from_millis(50),
        ));

        let cancel = CancellationToken::new();
        let handle = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };

        // Give the service a couple of batch intervals.
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(repo.count_trades().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_flush() {
        let (repo, _temp) = setup_repo().await;
        let bus = InProcessBus::new(1);
        bus.publish(TRADES_TOPIC, trade_payload("7", 1_000))
            .await
            .unwrap();

        let consumer = Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await);
        // Batch interval far longer than the test: only the shutdown flush
        // can persist the trade.
        let service = Arc::new(PersistenceService::new(
            consumer,
            repo.clone(),
            Duration::from_secs(3600),
        ));

        let cancel = CancellationToken::new();
        let handle = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(repo.count_trades().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_history_orders_by_time() {
        let (repo, _temp) = setup_repo().await;
        let trades = vec![
            Trade::new(
                Side::Sell,
                Decimal::from_str_canonical("2").unwrap(),
                Utc.timestamp_millis_opt(2_000).unwrap(),
                0,
                1,
            ),
            Trade::new(
                Side::Buy,
                Decimal::from_str_canonical("1").unwrap(),
                Utc.timestamp_millis_opt(1_000).unwrap(),
                0,
                0,
            ),
        ];
        repo.upsert_trades_batch(&trades).await.unwrap();

        let history = StoreTradeHistory::new(repo);
        let got = history
            .trades_for_period(
                Utc.timestamp_millis_opt(0).unwrap(),
                Utc.timestamp_millis_opt(10_000).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].time < got[1].time);
    }
}
