//! Trade collection operations.

use crate::domain::{from_epoch_ms, to_epoch_ms, Decimal, Side, Trade};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::warn;

use super::{BulkWriteOutcome, Repository};

impl Repository {
    /// Bulk-upsert a batch of trades keyed by `(partition, offset)`.
    ///
    /// Unordered: every row is attempted even if an earlier one fails, and
    /// row failures are reported in the outcome instead of aborting the
    /// batch. Duplicates count as `matched`.
    ///
    /// # Errors
    /// Returns an error only when the transaction itself cannot be opened or
    /// committed; per-row rejections land in `BulkWriteOutcome::failed`.
    pub async fn upsert_trades_batch(
        &self,
        trades: &[Trade],
    ) -> Result<BulkWriteOutcome, sqlx::Error> {
        if trades.is_empty() {
            return Ok(BulkWriteOutcome::default());
        }

        let created_at_ms = Utc::now().timestamp_millis();
        let mut outcome = BulkWriteOutcome::default();

        let mut tx = self.pool.begin().await?;

        for trade in trades {
            let result = sqlx::query(
                r#"
                INSERT INTO trades (partition_id, log_offset, side, volume, time_ms, created_at_ms)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(partition_id, log_offset) DO NOTHING
                "#,
            )
            .bind(trade.partition)
            .bind(trade.offset)
            .bind(trade.side.to_string())
            .bind(trade.volume.to_canonical_string())
            .bind(to_epoch_ms(trade.time))
            .bind(created_at_ms)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => outcome.upserted += 1,
                Ok(_) => outcome.matched += 1,
                Err(e) => {
                    warn!(
                        partition = trade.partition,
                        offset = trade.offset,
                        error = %e,
                        "Trade row rejected by store"
                    );
                    outcome.failed += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// All stored trades with `start <= time <= end`, ordered by time
    /// ascending.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_trades_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT partition_id, log_offset, side, volume, time_ms
            FROM trades
            WHERE time_ms >= ? AND time_ms <= ?
            ORDER BY time_ms ASC, partition_id ASC, log_offset ASC
            "#,
        )
        .bind(to_epoch_ms(start))
        .bind(to_epoch_ms(end))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(trade_from_row).collect())
    }

    /// Total number of stored trades.
    pub async fn count_trades(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

fn trade_from_row(row: &sqlx::sqlite::SqliteRow) -> Trade {
    let side_str: String = row.get("side");
    let side = Side::parse(&side_str).unwrap_or_else(|| {
        warn!(side = %side_str, "Unknown side in store, defaulting to BUY");
        Side::Buy
    });

    let volume_str: String = row.get("volume");
    let volume = Decimal::from_str_canonical(&volume_str).unwrap_or_else(|e| {
        warn!(volume = %volume_str, error = %e, "Failed to parse volume decimal, using zero");
        Decimal::zero()
    });

    Trade::new(
        side,
        volume,
        from_epoch_ms(row.get("time_ms")),
        row.get("partition_id"),
        row.get("log_offset"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
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

    fn trade(partition: i32, offset: i64, side: Side, volume: &str, time_ms: i64) -> Trade {
        Trade::new(
            side,
            Decimal::from_str_canonical(volume).unwrap(),
            Utc.timestamp_millis_opt(time_ms).unwrap(),
            partition,
            offset,
        )
    }

    #[tokio::test]
    async fn test_upsert_and_query_range() {
        let (repo, _temp) = setup_repo().await;

        let trades = vec![
            trade(0, 0, Side::Buy, "100", 1_000),
            trade(0, 1, Side::Sell, "50", 2_000),
            trade(1, 0, Side::Buy, "25", 3_000),
        ];
        let outcome = repo.upsert_trades_batch(&trades).await.unwrap();
        assert_eq!(outcome.upserted, 3);
        assert_eq!(outcome.failed, 0);

        let start = Utc.timestamp_millis_opt(1_000).unwrap();
        let end = Utc.timestamp_millis_opt(2_000).unwrap();
        let stored = repo.query_trades_in_range(start, end).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].time <= stored[1].time);
    }

    #[tokio::test]
    async fn test_range_query_inclusive_both_ends() {
        let (repo, _temp) = setup_repo().await;
        let trades = vec![
            trade(0, 0, Side::Buy, "1", 999),
            trade(0, 1, Side::Buy, "2", 1_000),
            trade(0, 2, Side::Buy, "3", 2_000),
            trade(0, 3, Side::Buy, "4", 2_001),
        ];
        repo.upsert_trades_batch(&trades).await.unwrap();

        let start = Utc.timestamp_millis_opt(1_000).unwrap();
        let end = Utc.timestamp_millis_opt(2_000).unwrap();
        let stored = repo.query_trades_in_range(start, end).await.unwrap();
        let offsets: Vec<i64> = stored.iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reflush_is_idempotent() {
        let (repo, _temp) = setup_repo().await;
        let trades = vec![
            trade(0, 0, Side::Buy, "100", 1_000),
            trade(0, 1, Side::Sell, "50", 2_000),
        ];

        let first = repo.upsert_trades_batch(&trades).await.unwrap();
        assert_eq!(first.upserted, 2);
        assert_eq!(first.matched, 0);

        let second = repo.upsert_trades_batch(&trades).await.unwrap();
        assert_eq!(second.upserted, 0);
        assert_eq!(second.matched, 2);

        assert_eq!(repo.count_trades().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_duplicate_batch() {
        let (repo, _temp) = setup_repo().await;
        repo.upsert_trades_batch(&[trade(0, 0, Side::Buy, "100", 1_000)])
            .await
            .unwrap();

        let outcome = repo
            .upsert_trades_batch(&[
                trade(0, 0, Side::Buy, "100", 1_000),
                trade(0, 1, Side::Sell, "50", 2_000),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.upserted, 1);
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.successful(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (repo, _temp) = setup_repo().await;
        let outcome = repo.upsert_trades_batch(&[]).await.unwrap();
        assert_eq!(outcome, BulkWriteOutcome::default());
    }
}
