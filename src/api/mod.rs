//! HTTP surface: the trades RPC, the PnL summary, and health probes.

pub mod client;
pub mod health;
pub mod pnl;
pub mod trades;

pub use client::PersistenceClient;

use crate::db::Repository;
use crate::pipeline::TradeHistory;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Backend for the trades RPC: the range-query router in the trades
    /// service, the store directly in the persistence service.
    pub trades: Arc<dyn TradeHistory>,
    pub repo: Repository,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/trades/get-for-period", post(trades::get_trades_for_period))
        .route("/pnl/summary", get(pnl::get_pnl_summary))
        .with_state(state)
}
