//! Market collection operations, including the atomic market+PnL write.

use crate::db::is_unique_violation;
use crate::domain::{to_epoch_ms, MarketInterval, PnlRecord};
use chrono::{DateTime, Utc};

use super::{MarketWrite, Repository};

impl Repository {
    /// Atomically write a market interval and its derived PnL record.
    ///
    /// Both documents land in one transaction. A unique-key violation on
    /// either (same interval or same bus source already written) means a
    /// concurrent or earlier writer won: the transaction is rolled back and
    /// the call reports success as [`MarketWrite::AlreadyExists`].
    ///
    /// # Errors
    /// Any non-duplicate store error is re-raised.
    pub async fn insert_market_with_pnl(
        &self,
        market: &MarketInterval,
        pnl: &PnlRecord,
    ) -> Result<MarketWrite, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let market_result = sqlx::query(
            r#"
            INSERT INTO markets (partition_id, log_offset, buy_price, sell_price,
                                 start_time_ms, end_time_ms, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(market.partition)
        .bind(market.offset)
        .bind(market.buy_price.to_canonical_string())
        .bind(market.sell_price.to_canonical_string())
        .bind(to_epoch_ms(market.start_time))
        .bind(to_epoch_ms(market.end_time))
        .bind(to_epoch_ms(pnl.created_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = market_result {
            if is_unique_violation(&e) {
                tx.rollback().await?;
                return Ok(MarketWrite::AlreadyExists);
            }
            return Err(e);
        }

        let pnl_result = sqlx::query(
            r#"
            INSERT INTO pnls (market_start_time_ms, market_end_time_ms, buy_price, sell_price,
                              total_buy_volume, total_sell_volume, total_buy_cost,
                              total_sell_revenue, total_fees, pnl, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_epoch_ms(pnl.market_start_time))
        .bind(to_epoch_ms(pnl.market_end_time))
        .bind(pnl.buy_price.to_canonical_string())
        .bind(pnl.sell_price.to_canonical_string())
        .bind(pnl.total_buy_volume.to_canonical_string())
        .bind(pnl.total_sell_volume.to_canonical_string())
        .bind(pnl.total_buy_cost.to_canonical_string())
        .bind(pnl.total_sell_revenue.to_canonical_string())
        .bind(pnl.total_fees.to_canonical_string())
        .bind(pnl.pnl.to_canonical_string())
        .bind(to_epoch_ms(pnl.created_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = pnl_result {
            if is_unique_violation(&e) {
                tx.rollback().await?;
                return Ok(MarketWrite::AlreadyExists);
            }
            return Err(e);
        }

        tx.commit().await?;
        Ok(MarketWrite::Inserted)
    }

    /// Whether a market record exists for `(start, end)`.
    pub async fn market_exists(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM markets WHERE start_time_ms = ? AND end_time_ms = ?",
        )
        .bind(to_epoch_ms(start))
        .bind(to_epoch_ms(end))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    /// Total number of stored market records.
    pub async fn count_markets(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM markets")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::Decimal;
    use chrono::TimeZone;
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

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn market(partition: i32, offset: i64, start_ms: i64, end_ms: i64) -> MarketInterval {
        MarketInterval {
            buy_price: dec("50"),
            sell_price: dec("55"),
            start_time: Utc.timestamp_millis_opt(start_ms).unwrap(),
            end_time: Utc.timestamp_millis_opt(end_ms).unwrap(),
            partition,
            offset,
        }
    }

    fn pnl_for(market: &MarketInterval) -> PnlRecord {
        PnlRecord::compute(market, &[], dec("0.13"), Utc::now())
    }

    #[tokio::test]
    async fn test_atomic_write_creates_both_records() {
        let (repo, _temp) = setup_repo().await;
        let market = market(0, 0, 0, 60_000);
        let pnl = pnl_for(&market);

        let write = repo.insert_market_with_pnl(&market, &pnl).await.unwrap();
        assert_eq!(write, MarketWrite::Inserted);
        assert!(repo
            .market_exists(market.start_time, market.end_time)
            .await
            .unwrap());
        assert_eq!(repo.count_markets().await.unwrap(), 1);
        assert!(repo.latest_pnl().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_interval_is_noop_success() {
        let (repo, _temp) = setup_repo().await;
        let first = market(0, 0, 0, 60_000);
        repo.insert_market_with_pnl(&first, &pnl_for(&first))
            .await
            .unwrap();

        // Same interval arriving from a different bus source.
        let second = market(1, 5, 0, 60_000);
        let write = repo
            .insert_market_with_pnl(&second, &pnl_for(&second))
            .await
            .unwrap();
        assert_eq!(write, MarketWrite::AlreadyExists);

        // Exactly one market and one PnL record survive.
        assert_eq!(repo.count_markets().await.unwrap(), 1);
        let latest = repo.latest_pnl().await.unwrap().unwrap();
        assert_eq!(
            latest.market_end_time,
            Utc.timestamp_millis_opt(60_000).unwrap()
        );
    }

    #[tokio::test]
    async fn test_duplicate_source_key_is_noop_success() {
        let (repo, _temp) = setup_repo().await;
        let first = market(0, 0, 0, 60_000);
        repo.insert_market_with_pnl(&first, &pnl_for(&first))
            .await
            .unwrap();

        // Redelivery: same (partition, offset), different interval.
        let redelivered = market(0, 0, 60_000, 120_000);
        let write = repo
            .insert_market_with_pnl(&redelivered, &pnl_for(&redelivered))
            .await
            .unwrap();
        assert_eq!(write, MarketWrite::AlreadyExists);
        assert_eq!(repo.count_markets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_neither_record() {
        let (repo, _temp) = setup_repo().await;
        let first = market(0, 0, 0, 60_000);
        repo.insert_market_with_pnl(&first, &pnl_for(&first))
            .await
            .unwrap();

        // New market interval whose PnL collides with the existing one:
        // the PnL insert fails, so the market insert must roll back too.
        let second = market(0, 1, 120_000, 180_000);
        let mut colliding_pnl = pnl_for(&second);
        colliding_pnl.market_start_time = first.start_time;
        colliding_pnl.market_end_time = first.end_time;

        let write = repo
            .insert_market_with_pnl(&second, &colliding_pnl)
            .await
            .unwrap();
        assert_eq!(write, MarketWrite::AlreadyExists);
        assert!(!repo
            .market_exists(second.start_time, second.end_time)
            .await
            .unwrap());
        assert_eq!(repo.count_markets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_market_exists_false_for_unknown_interval() {
        let (repo, _temp) = setup_repo().await;
        let start = Utc.timestamp_millis_opt(0).unwrap();
        let end = Utc.timestamp_millis_opt(60_000).unwrap();
        assert!(!repo.market_exists(start, end).await.unwrap());
    }
}
