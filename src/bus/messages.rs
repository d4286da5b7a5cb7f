//! Wire contracts for the `trades` and `market` topics.
//!
//! Both topics carry UTF-8 JSON with a `messageType` discriminator. Decimals
//! are strings, instants are RFC 3339. Parsing failures are dead-letter
//! material: callers log and drop, they never crash the consumer loop.

use crate::domain::{Decimal, MarketInterval, Side, Trade};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload of the `trades` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMessage {
    pub message_type: String,
    pub trade_type: Side,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
}

impl TradeMessage {
    pub fn new(trade_type: Side, volume: Decimal, time: DateTime<Utc>) -> Self {
        TradeMessage {
            message_type: "trades".to_string(),
            trade_type,
            volume,
            time,
        }
    }

    /// Encode for publishing.
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("trade message serialization cannot fail")
    }
}

/// Payload of the `market` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMessage {
    pub message_type: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl MarketMessage {
    pub fn new(
        buy_price: Decimal,
        sell_price: Decimal,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        MarketMessage {
            message_type: "market".to_string(),
            buy_price,
            sell_price,
            start_time,
            end_time,
        }
    }

    /// Encode for publishing.
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("market message serialization cannot fail")
    }
}

/// Decode a `trades` payload delivered on `(partition, offset)`.
pub fn parse_trade(payload: &[u8], partition: i32, offset: i64) -> Result<Trade, CodecError> {
    let message: TradeMessage = serde_json::from_slice(payload)?;
    if message.message_type != "trades" {
        return Err(CodecError::WrongMessageType {
            expected: "trades",
            actual: message.message_type,
        });
    }
    if !message.volume.is_positive() {
        return Err(CodecError::NonPositiveVolume(
            message.volume.to_canonical_string(),
        ));
    }
    Ok(Trade::new(
        message.trade_type,
        message.volume,
        message.time,
        partition,
        offset,
    ))
}

/// Decode a `market` payload delivered on `(partition, offset)`.
pub fn parse_market(
    payload: &[u8],
    partition: i32,
    offset: i64,
) -> Result<MarketInterval, CodecError> {
    let message: MarketMessage = serde_json::from_slice(payload)?;
    if message.message_type != "market" {
        return Err(CodecError::WrongMessageType {
            expected: "market",
            actual: message.message_type,
        });
    }
    Ok(MarketInterval {
        buy_price: message.buy_price,
        sell_price: message.sell_price,
        start_time: message.start_time,
        end_time: message.end_time,
        partition,
        offset,
    })
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wrong messageType: expected {expected}, got {actual}")]
    WrongMessageType {
        expected: &'static str,
        actual: String,
    },
    #[error("volume must be > 0, got {0}")]
    NonPositiveVolume(String),
}
