//! PnL collection queries backing the aggregation view.

use crate::domain::{from_epoch_ms, Decimal, PnlRecord};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::warn;

use super::Repository;

impl Repository {
    /// The most recent PnL record by `market_end_time`, if any.
    pub async fn latest_pnl(&self) -> Result<Option<PnlRecord>, sqlx::Error> {
        let row = sqlx::query(PNL_SELECT_LATEST).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(pnl_from_row))
    }

    /// All PnL records with `market_end_time >= cutoff`, newest first.
    pub async fn pnls_ending_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PnlRecord>, sqlx::Error> {
        let rows = sqlx::query(PNL_SELECT_SINCE)
            .bind(cutoff.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(pnl_from_row).collect())
    }

    /// Total number of stored PnL records.
    pub async fn count_pnls(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pnls")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

const PNL_SELECT_LATEST: &str = "\
    SELECT market_start_time_ms, market_end_time_ms, buy_price, sell_price,
           total_buy_volume, total_sell_volume, total_buy_cost, total_sell_revenue,
           total_fees, pnl, created_at_ms
    FROM pnls
    ORDER BY market_end_time_ms DESC
    LIMIT 1";

const PNL_SELECT_SINCE: &str = "\
    SELECT market_start_time_ms, market_end_time_ms, buy_price, sell_price,
           total_buy_volume, total_sell_volume, total_buy_cost, total_sell_revenue,
           total_fees, pnl, created_at_ms
    FROM pnls
    WHERE market_end_time_ms >= ?
    ORDER BY market_end_time_ms DESC";

fn pnl_from_row(row: &sqlx::sqlite::SqliteRow) -> PnlRecord {
    let parse = |column: &str| -> Decimal {
        let raw: String = row.get(column);
        Decimal::from_str_canonical(&raw).unwrap_or_else(|e| {
            warn!(column, value = %raw, error = %e, "Failed to parse stored decimal, using zero");
            Decimal::zero()
        })
    };

    PnlRecord {
        market_start_time: from_epoch_ms(row.get("market_start_time_ms")),
        market_end_time: from_epoch_ms(row.get("market_end_time_ms")),
        buy_price: parse("buy_price"),
        sell_price: parse("sell_price"),
        total_buy_volume: parse("total_buy_volume"),
        total_sell_volume: parse("total_sell_volume"),
        total_buy_cost: parse("total_buy_cost"),
        total_sell_revenue: parse("total_sell_revenue"),
        total_fees: parse("total_fees"),
        pnl: parse("pnl"),
        created_at: from_epoch_ms(row.get("created_at_ms")),
    }
}
