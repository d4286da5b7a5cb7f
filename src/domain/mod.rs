//! Core domain types shared by every component.

pub mod decimal;
pub mod market;
pub mod pnl;
pub mod primitives;
pub mod trade;

pub use decimal::Decimal;
pub use market::MarketInterval;
pub use pnl::PnlRecord;
pub use primitives::{from_epoch_ms, to_epoch_ms, Side};
pub use trade::Trade;
