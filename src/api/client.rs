//! HTTP client for the persistence service's range-query RPC.

use crate::api::trades::{GetTradesRequest, GetTradesResponse};
use crate::domain::Trade;
use crate::pipeline::{HistoryError, TradeHistory};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Client side of `TradesService.GetTradesForPeriod` against the
/// persistence service. The whole call, retries included, is bounded by the
/// configured deadline.
#[derive(Debug, Clone)]
pub struct PersistenceClient {
    client: Client,
    base_url: String,
    deadline: Duration,
}

impl PersistenceClient {
    pub fn new(base_url: String, deadline: Duration) -> Self {
        let client = Client::builder()
            .timeout(deadline)
            .build()
            .unwrap_or_default();
        PersistenceClient {
            client,
            base_url,
            deadline,
        }
    }

    async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<GetTradesResponse, HistoryError> {
        let url = format!("{}/trades/get-for-period", self.base_url);
        let request = GetTradesRequest {
            start_time: start.to_rfc3339(),
            end_time: end.to_rfc3339(),
        };
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(self.deadline),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(HistoryError::Rpc(e.to_string())))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(HistoryError::Rpc(format!(
                    "server error {status}"
                ))));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(HistoryError::Rpc(format!(
                    "client error {status}"
                ))));
            }

            response
                .json::<GetTradesResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(HistoryError::Rpc(e.to_string())))
        })
        .await
    }
}

#[async_trait]
impl TradeHistory for PersistenceClient {
    async fn trades_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, HistoryError> {
        debug!(%start, %end, "Fetching trades from persistence service");
        let response = self.fetch(start, end).await?;

        // The RPC does not carry the bus source key; -1 marks a trade whose
        // provenance is the store, never re-persisted.
        Ok(response
            .trades
            .into_iter()
            .map(|dto| Trade::new(dto.trade_type, dto.volume, dto.time, -1, -1))
            .collect())
    }
}
