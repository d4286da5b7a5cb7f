//! Stream-processing pipelines: persistence (trades), calculation (markets),
//! range-query routing, and the PnL aggregation view.

pub mod aggregation;
pub mod calculation;
pub mod commit;
pub mod memory_feed;
pub mod persistence;
pub mod router;

use crate::domain::Trade;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use aggregation::{pnl_summary, PnlSummaryEntry};
pub use calculation::CalculationService;
pub use commit::CommitTracker;
pub use memory_feed::MemoryFeed;
pub use persistence::{PersistenceService, StoreTradeHistory};
pub use router::TradeRouter;

/// Source of trades for a time window.
///
/// Implemented by the range-query router (memory-or-store), by the
/// persistence RPC client, and by the repository-backed history used when
/// router and persistence share a process.
#[async_trait]
pub trait TradeHistory: Send + Sync {
    /// All trades with `start <= time <= end`, ordered by time ascending.
    async fn trades_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, HistoryError>;
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("store query failed: {0}")]
    Store(#[from] sqlx::Error),
    #[error("trades RPC failed: {0}")]
    Rpc(String),
}
