//! Store module for the trades, markets, and pnls collections.
//!
//! SQLite carries the document-store contract: unique indexes on
//! `(partition, offset)` and `(startTime, endTime)`, multi-row transactions
//! for the atomic market+PnL write, WAL journal mode.

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{BulkWriteOutcome, MarketWrite, Repository};

/// Classify a store error as a unique-key violation (the idempotent-write
/// signal; swallowed by callers, never surfaced).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
