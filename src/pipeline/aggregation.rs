//! Aggregated PnL view: latest interval, last minute, last five minutes.

use crate::db::Repository;
use crate::domain::Decimal;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// One window of the aggregated view. Times are human-formatted
/// (`YYYY-MM-DD HH:MM`, UTC); the pnl is rounded to two decimal places.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlSummaryEntry {
    pub start_time: String,
    pub end_time: String,
    pub pnl: Decimal,
}

/// Produce the three-window summary, anchored at the most recent PnL
/// record's interval end. Empty store means an empty summary.
pub async fn pnl_summary(repo: &Repository) -> Result<Vec<PnlSummaryEntry>, sqlx::Error> {
    let Some(latest) = repo.latest_pnl().await? else {
        return Ok(Vec::new());
    };

    let reference = latest.market_end_time;
    let minute_cutoff = reference - Duration::seconds(60);
    let five_minute_cutoff = reference - Duration::seconds(300);

    let recent = repo.pnls_ending_since(five_minute_cutoff).await?;
    let minute_pnl: Decimal = recent
        .iter()
        .filter(|r| r.market_end_time >= minute_cutoff)
        .map(|r| r.pnl)
        .sum();
    let five_minute_pnl: Decimal = recent.iter().map(|r| r.pnl).sum();

    // The latest interval's pnl, restated from its parts rather than the
    // stored pnl column.
    let latest_pnl = latest.total_sell_revenue - latest.total_buy_cost;

    Ok(vec![
        PnlSummaryEntry {
            start_time: format_minute(latest.market_start_time),
            end_time: format_minute(latest.market_end_time),
            pnl: latest_pnl.round_dp(2),
        },
        PnlSummaryEntry {
            start_time: format_minute(minute_cutoff),
            end_time: format_minute(reference),
            pnl: minute_pnl.round_dp(2),
        },
        PnlSummaryEntry {
            start_time: format_minute(five_minute_cutoff),
            end_time: format_minute(reference),
            pnl: five_minute_pnl.round_dp(2),
        },
    ])
}

fn format_minute(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M").to_string()
}
