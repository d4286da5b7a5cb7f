//! Feeds the trade memory buffer from the `trades` topic and runs the
//! retention sweep (consumer group `trade-memory-service-group`).

use crate::bus::messages::parse_trade;
use crate::bus::BusConsumer;
use crate::memory::TradeMemory;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_SLICE: Duration = Duration::from_millis(200);

/// Consumer loop owning the write side of the trade memory buffer.
pub struct MemoryFeed {
    consumer: Arc<dyn BusConsumer>,
    memory: Arc<Mutex<TradeMemory>>,
    sweep_interval: Duration,
}

impl MemoryFeed {
    pub fn new(consumer: Arc<dyn BusConsumer>, memory: Arc<Mutex<TradeMemory>>) -> Self {
        MemoryFeed {
            consumer,
            memory,
            sweep_interval: Duration::from_secs(1),
        }
    }

    /// Override the sweep cadence (tests).
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Consume until cancelled, sweeping expired trades on a timer.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut next_sweep = Instant::now() + self.sweep_interval;

        while !cancel.is_cancelled() {
            let until_sweep = next_sweep.saturating_duration_since(Instant::now());
            match self.consumer.poll(until_sweep.min(POLL_SLICE)).await {
                Ok(Some(delivery)) => {
                    match parse_trade(&delivery.payload, delivery.partition, delivery.offset) {
                        Ok(trade) => {
                            let late = self.memory.lock().await.add(trade);
                            if let Some(late) = late {
                                warn!(
                                    trade_time = %late.trade_time,
                                    queried_start = %late.queried_start,
                                    queried_end = %late.queried_end,
                                    "Possible out-of-order trade inside already-queried range"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(
                                partition = delivery.partition,
                                offset = delivery.offset,
                                error = %e,
                                "[DLQ] Dropping malformed trade message"
                            );
                        }
                    }
                    if let Err(e) = self
                        .consumer
                        .commit(delivery.partition, delivery.offset + 1)
                        .await
                    {
                        // Buffer content is ephemeral; a failed commit only
                        // means redelivery after restart.
                        warn!(error = %e, "Memory feed offset commit failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Memory feed poll failed");
                    tokio::time::sleep(POLL_SLICE).await;
                }
            }

            if Instant::now() >= next_sweep {
                self.memory.lock().await.sweep(Utc::now());
                next_sweep = Instant::now() + self.sweep_interval;
            }
        }

        info!("Memory feed stopped");
    }
}
