//! Aggregated PnL summary endpoint.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::error::AppError;
use crate::pipeline::{pnl_summary, PnlSummaryEntry};

pub async fn get_pnl_summary(
    State(state): State<AppState>,
) -> Result<Json<Vec<PnlSummaryEntry>>, AppError> {
    let summary = pnl_summary(&state.repo).await?;
    Ok(Json(summary))
}
