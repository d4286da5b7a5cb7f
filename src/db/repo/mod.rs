//! Repository layer over the store collections.

mod markets;
mod pnls;
mod trades;

use sqlx::SqlitePool;

/// Repository for store operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Close the underlying pool (graceful shutdown).
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Outcome of a bulk trade upsert.
///
/// `upserted` counts newly written documents, `matched` counts idempotent
/// duplicates (both safe outcomes), `failed` counts rows the store rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub upserted: usize,
    pub matched: usize,
    pub failed: usize,
}

impl BulkWriteOutcome {
    /// Rows that are durably in the store after the batch.
    pub fn successful(&self) -> usize {
        self.upserted + self.matched
    }

    /// True when some rows failed while others succeeded.
    pub fn is_partial_failure(&self) -> bool {
        self.failed > 0 && self.successful() > 0
    }
}

/// Result of the atomic market+PnL write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketWrite {
    /// Both documents written by this call.
    Inserted,
    /// A concurrent or earlier writer won; treated as success.
    AlreadyExists,
}
