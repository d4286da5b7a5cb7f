pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod retry;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{Decimal, MarketInterval, PnlRecord, Side, Trade};
pub use error::AppError;
pub use memory::TradeMemory;
