//! Per-interval profit-and-loss record and its derivation.

use crate::domain::{Decimal, MarketInterval, Side, Trade};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Profit-and-loss record derived from one market interval and the trades
/// whose timestamps fall inside it.
///
/// All derived fields are exact decimals; nothing is rounded until the
/// aggregated summary endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlRecord {
    pub market_start_time: DateTime<Utc>,
    pub market_end_time: DateTime<Utc>,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub total_buy_volume: Decimal,
    pub total_sell_volume: Decimal,
    pub total_buy_cost: Decimal,
    pub total_sell_revenue: Decimal,
    pub total_fees: Decimal,
    pub pnl: Decimal,
    pub created_at: DateTime<Utc>,
}

impl PnlRecord {
    /// Derive the PnL record for `market` from the trades settled inside it.
    ///
    /// Per-side totals:
    ///   total_buy_cost     = buy_volume * buy_price + buy_volume * fee
    ///   total_sell_revenue = sell_volume * sell_price - sell_volume * fee
    ///   total_fees         = (buy_volume + sell_volume) * fee
    ///   pnl                = total_sell_revenue - total_buy_cost
    ///
    /// Trades outside `[start_time, end_time]` are the caller's bug; the
    /// fetch layer already windows them, so no filtering happens here.
    pub fn compute(
        market: &MarketInterval,
        trades: &[Trade],
        fee: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut total_buy_volume = Decimal::zero();
        let mut total_sell_volume = Decimal::zero();

        for trade in trades {
            match trade.side {
                Side::Buy => total_buy_volume = total_buy_volume + trade.volume,
                Side::Sell => total_sell_volume = total_sell_volume + trade.volume,
            }
        }

        let total_buy_cost = total_buy_volume * market.buy_price + total_buy_volume * fee;
        let total_sell_revenue = total_sell_volume * market.sell_price - total_sell_volume * fee;
        let total_fees = (total_buy_volume + total_sell_volume) * fee;
        let pnl = total_sell_revenue - total_buy_cost;

        PnlRecord {
            market_start_time: market.start_time,
            market_end_time: market.end_time,
            buy_price: market.buy_price,
            sell_price: market.sell_price,
            total_buy_volume,
            total_sell_volume,
            total_buy_cost,
            total_sell_revenue,
            total_fees,
            pnl,
            created_at,
        }
    }
}
