//! Message-bus contract: partitioned, log-based, at-least-once.
//!
//! The bus itself is an external collaborator; this module defines the seam
//! the pipelines consume it through. [`in_process::InProcessBus`] implements
//! the same contract as a broker adapter would: partitioned append-only logs,
//! per-group committed offsets, redelivery of uncommitted messages.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod in_process;
pub mod messages;

pub use in_process::{InProcessBus, InProcessConsumer};

/// Topic carrying trade events.
pub const TRADES_TOPIC: &str = "trades";
/// Topic carrying market-interval events.
pub const MARKET_TOPIC: &str = "market";

/// Consumer group of the trade memory buffer service.
pub const TRADE_MEMORY_GROUP: &str = "trade-memory-service-group";
/// Consumer group of the trade persistence service.
pub const TRADE_PERSISTENCE_GROUP: &str = "trade-persistence-service-group";
/// Consumer group of the calculation service.
pub const CALCULATION_GROUP: &str = "calculation-service-group";

/// A single message delivered from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Consumer side of the bus for one `(topic, group)` subscription.
///
/// Commits are manual: `commit(partition, next_offset)` acknowledges every
/// offset strictly below `next_offset` on that partition.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Receive the next delivery, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when no message arrived within the timeout.
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BusError>;

    /// Commit `next_offset` as the next offset to read on `partition`.
    async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), BusError>;
}

/// Producer side of the bus.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publish a payload to a topic; the bus picks the partition.
    ///
    /// Returns the `(partition, offset)` the message landed on.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(i32, i64), BusError>;
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,
    #[error("commit rejected: {0}")]
    Commit(String),
    #[error("bus error: {0}")]
    Other(String),
}
