//! Ordered-commit behavior of the calculation pipeline under concurrent,
//! out-of-order interval processing.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use intrapnl::bus::messages::MarketMessage;
use intrapnl::bus::{InProcessBus, CALCULATION_GROUP, MARKET_TOPIC};
use intrapnl::db::init_db;
use intrapnl::pipeline::{CalculationService, HistoryError, TradeHistory};
use intrapnl::{Decimal, Repository, Trade};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn dec(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

/// Trade source whose response latency depends on the interval start, so
/// later offsets finish before earlier ones.
struct StaggeredTrades;

#[async_trait]
impl TradeHistory for StaggeredTrades {
    async fn trades_for_period(
        &self,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, HistoryError> {
        // Interval starting at 0ms sleeps longest; 120_000ms shortest.
        let delay_ms = 450u64.saturating_sub((start.timestamp_millis() / 1_000) as u64 * 3 / 2);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(Vec::new())
    }
}

async fn setup() -> (Arc<CalculationService>, Repository, InProcessBus, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Repository::new(pool);

    let bus = InProcessBus::new(2);
    let consumer = Arc::new(bus.subscribe(MARKET_TOPIC, CALCULATION_GROUP).await);
    let service = Arc::new(CalculationService::new(
        consumer,
        repo.clone(),
        Arc::new(StaggeredTrades),
        dec("0.13"),
        100,
    ));
    (service, repo, bus, temp_dir)
}

fn market_payload(start_ms: i64, end_ms: i64) -> Vec<u8> {
    MarketMessage::new(dec("50"), dec("55"), at(start_ms), at(end_ms)).to_payload()
}

#[tokio::test]
async fn test_commits_follow_offset_order_despite_reverse_completion() {
    let (service, repo, bus, _temp) = setup().await;

    // Three intervals on partition 0; processing latency is inverted, so
    // offset 2 completes first and offset 0 last.
    for i in 0..3 {
        let start = i * 60_000;
        bus.publish_to(MARKET_TOPIC, 0, market_payload(start, start + 60_000))
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let handle = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };

    // Wait for all three PnL records, then for the commit chain to drain.
    for _ in 0..200 {
        if bus
            .committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 0)
            .await
            == Some(3)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(repo.count_pnls().await.unwrap(), 3);

    // Every commit the group ever issued, in call order: one monotonic run,
    // strictly increasing by one, fired only once the full prefix was done.
    let history = bus.commit_history(CALCULATION_GROUP, MARKET_TOPIC).await;
    assert_eq!(history, vec![(0, 1), (0, 2), (0, 3)]);
}

#[tokio::test]
async fn test_partitions_commit_independently() {
    let (service, _repo, bus, _temp) = setup().await;

    bus.publish_to(MARKET_TOPIC, 0, market_payload(0, 60_000))
        .await
        .unwrap();
    bus.publish_to(MARKET_TOPIC, 1, market_payload(300_000, 360_000))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };

    for _ in 0..200 {
        let p0 = bus
            .committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 0)
            .await;
        let p1 = bus
            .committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 1)
            .await;
        if p0 == Some(1) && p1 == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(
        bus.committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 0).await,
        Some(1)
    );
    assert_eq!(
        bus.committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 1).await,
        Some(1)
    );
}

#[tokio::test]
async fn test_malformed_market_message_does_not_stall_the_chain() {
    let (service, repo, bus, _temp) = setup().await;

    bus.publish_to(MARKET_TOPIC, 0, market_payload(0, 60_000))
        .await
        .unwrap();
    bus.publish_to(MARKET_TOPIC, 0, b"{]".to_vec()).await.unwrap();
    bus.publish_to(MARKET_TOPIC, 0, market_payload(120_000, 180_000))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };

    for _ in 0..200 {
        if bus
            .committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 0)
            .await
            == Some(3)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    cancel.cancel();
    handle.await.unwrap();

    // The dead-lettered offset 1 was skipped but still acknowledged in
    // order; both valid intervals produced records.
    assert_eq!(
        bus.committed_offset(CALCULATION_GROUP, MARKET_TOPIC, 0).await,
        Some(3)
    );
    assert_eq!(repo.count_pnls().await.unwrap(), 2);
}
