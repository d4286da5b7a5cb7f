//! In-process partitioned log implementing the bus contract.
//!
//! Topics are append-only logs split across a fixed number of partitions.
//! Offsets are monotonic per partition. Each consumer group keeps a committed
//! "next offset to read" per partition; a fresh subscription resumes from the
//! committed offsets, so uncommitted messages are redelivered (at-least-once).

use super::{BusConsumer, BusError, BusProducer, Delivery};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct TopicLog {
    partitions: Vec<Vec<Vec<u8>>>,
    next_partition: usize,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicLog>,
    /// (group, topic, partition) -> committed next offset to read.
    committed: HashMap<(String, String, i32), i64>,
    /// (group, topic) -> every commit call in order, for observability.
    commit_log: HashMap<(String, String), Vec<(i32, i64)>>,
}

/// Shared in-process bus handle. Cheap to clone.
#[derive(Clone)]
pub struct InProcessBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    default_partitions: usize,
}

impl InProcessBus {
    /// Create a bus whose topics each have `partitions` partitions.
    pub fn new(partitions: usize) -> Self {
        InProcessBus {
            state: Arc::new(Mutex::new(BusState::default())),
            notify: Arc::new(Notify::new()),
            default_partitions: partitions.max(1),
        }
    }

    /// Subscribe a consumer group to a topic, resuming from committed offsets.
    pub async fn subscribe(&self, topic: &str, group: &str) -> InProcessConsumer {
        let positions = {
            let mut state = self.state.lock().await;
            let partition_count = self.ensure_topic(&mut state, topic);
            (0..partition_count as i32)
                .map(|p| {
                    let committed = state
                        .committed
                        .get(&(group.to_string(), topic.to_string(), p))
                        .copied()
                        .unwrap_or(0);
                    (p, committed)
                })
                .collect()
        };

        InProcessConsumer {
            bus: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            positions: Mutex::new(positions),
        }
    }

    /// Publish directly to a specific partition.
    pub async fn publish_to(
        &self,
        topic: &str,
        partition: i32,
        payload: Vec<u8>,
    ) -> Result<i64, BusError> {
        let offset = {
            let mut state = self.state.lock().await;
            self.ensure_topic(&mut state, topic);
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BusError::Other(format!("topic {topic} vanished")))?;
            let slot = log
                .partitions
                .get_mut(partition as usize)
                .ok_or_else(|| BusError::Other(format!("partition {partition} out of range")))?;
            slot.push(payload);
            (slot.len() - 1) as i64
        };
        self.notify.notify_waiters();
        Ok(offset)
    }

    /// The committed next-offset for a `(group, topic, partition)`, if any.
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Every commit a group issued on a topic, in call order.
    pub async fn commit_history(&self, group: &str, topic: &str) -> Vec<(i32, i64)> {
        let state = self.state.lock().await;
        state
            .commit_log
            .get(&(group.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_topic(&self, state: &mut BusState, topic: &str) -> usize {
        let default_partitions = self.default_partitions;
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog {
                partitions: vec![Vec::new(); default_partitions],
                next_partition: 0,
            });
        log.partitions.len()
    }
}

#[async_trait]
impl BusProducer for InProcessBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(i32, i64), BusError> {
        let (partition, offset) = {
            let mut state = self.state.lock().await;
            self.ensure_topic(&mut state, topic);
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BusError::Other(format!("topic {topic} vanished")))?;
            let partition = log.next_partition % log.partitions.len();
            log.next_partition = log.next_partition.wrapping_add(1);
            log.partitions[partition].push(payload);
            (partition as i32, (log.partitions[partition].len() - 1) as i64)
        };
        self.notify.notify_waiters();
        Ok((partition, offset))
    }
}

/// One group's subscription to one topic.
pub struct InProcessConsumer {
    bus: InProcessBus,
    topic: String,
    group: String,
    /// Per-partition read cursor, starting at the committed offset.
    positions: Mutex<HashMap<i32, i64>>,
}

impl InProcessConsumer {
    async fn try_next(&self) -> Option<Delivery> {
        let state = self.bus.state.lock().await;
        let log = state.topics.get(&self.topic)?;
        let mut positions = self.positions.lock().await;

        for (partition, slot) in log.partitions.iter().enumerate() {
            let partition = partition as i32;
            let cursor = positions.entry(partition).or_insert(0);
            if (*cursor as usize) < slot.len() {
                let delivery = Delivery {
                    partition,
                    offset: *cursor,
                    payload: slot[*cursor as usize].clone(),
                };
                *cursor += 1;
                return Some(delivery);
            }
        }
        None
    }
}

#[async_trait]
impl BusConsumer for InProcessConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        if let Some(delivery) = self.try_next().await {
            return Ok(Some(delivery));
        }
        // Arm the waiter before re-checking so a publish between the check
        // and the wait is not lost.
        let notified = self.bus.notify.notified();
        if let Some(delivery) = self.try_next().await {
            return Ok(Some(delivery));
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => return Ok(None),
        }
        Ok(self.try_next().await)
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), BusError> {
        if next_offset < 0 {
            return Err(BusError::Commit(format!(
                "negative next_offset {next_offset}"
            )));
        }
        let mut state = self.bus.state.lock().await;
        state.committed.insert(
            (self.group.clone(), self.topic.clone(), partition),
            next_offset,
        );
        state
            .commit_log
            .entry((self.group.clone(), self.topic.clone()))
            .or_default()
            .push((partition, next_offset));
        Ok(())
    }
}
