//! `TradesService.GetTradesForPeriod` endpoint.
//!
//! Shared by the persistence service (store-backed) and the trades service
//! (memory-or-store routed); the backend behind [`AppState`] decides which.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::domain::{Decimal, Side, Trade};
use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTradesRequest {
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTradesResponse {
    pub trades: Vec<TradeDto>,
}

/// Wire form of a trade: the bus source key does not travel over the RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeDto {
    pub trade_type: Side,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
}

impl From<Trade> for TradeDto {
    fn from(trade: Trade) -> Self {
        TradeDto {
            trade_type: trade.side,
            volume: trade.volume,
            time: trade.time,
        }
    }
}

pub async fn get_trades_for_period(
    State(state): State<AppState>,
    Json(request): Json<GetTradesRequest>,
) -> Result<Json<GetTradesResponse>, AppError> {
    let start = parse_rfc3339("startTime", &request.start_time)?;
    let end = parse_rfc3339("endTime", &request.end_time)?;

    let trades = state
        .trades
        .trades_for_period(start, end)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(GetTradesResponse {
        trades: trades.into_iter().map(TradeDto::from).collect(),
    }))
}

fn parse_rfc3339(field: &str, value: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| AppError::BadRequest(format!("{field} must be an RFC 3339 timestamp")))
}
