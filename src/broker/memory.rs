//! In-memory Broker
//!
//! A partitioned, append-only log held in process memory with consumer
//! group offsets. It keeps the properties the pipeline depends on:
//! per-key ordering, redelivery of anything not committed when a consumer
//! reconnects, and publish acknowledgements. Fault switches make
//! publish, subscribe and poll fail on demand.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    BrokerError, BrokerMessage, DeliveryReceipt, EventConsumer, EventPublisher, EventSubscriber,
};

const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Debug, Clone)]
struct Record {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_publishes: u32,
    failing_subscribes: u32,
    failing_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Record>>>,
    committed: HashMap<(String, String, i32), i64>,
    faults: Faults,
}

/// Broker held in process memory
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
    partitions: i32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            appended: Arc::new(Notify::new()),
            partitions: partitions.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Transport("broker lock poisoned".to_string()))
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Every message ever published to `topic`, partition by partition
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };

        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records
                    .iter()
                    .enumerate()
                    .map(move |(offset, record)| BrokerMessage {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: offset as i64,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    })
            })
            .collect()
    }

    /// Messages on `topic` not yet committed by `group_id`
    pub fn lag(&self, topic: &str, group_id: &str) -> i64 {
        let Ok(state) = self.lock() else {
            return 0;
        };
        let Some(partitions) = state.topics.get(topic) else {
            return 0;
        };

        partitions
            .iter()
            .enumerate()
            .map(|(partition, records)| {
                let committed = state
                    .committed
                    .get(&(group_id.to_string(), topic.to_string(), partition as i32))
                    .copied()
                    .unwrap_or(0);
                records.len() as i64 - committed
            })
            .sum()
    }

    /// Fail the next `count` publishes with a transport error
    pub fn fail_next_publishes(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_publishes = count;
        }
    }

    /// Fail the next `count` subscribe attempts
    pub fn fail_next_subscribes(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_subscribes = count;
        }
    }

    /// Fail the next `count` polls across all consumers
    pub fn fail_next_polls(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_polls = count;
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        let partition = self.partition_for(key);

        let receipt = {
            let mut state = self.lock()?;
            if state.faults.failing_publishes > 0 {
                state.faults.failing_publishes -= 1;
                return Err(BrokerError::Transport("injected publish failure".to_string()));
            }

            let partitions = self.partitions as usize;
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); partitions]);
            let records = &mut log[partition as usize];
            records.push(Record {
                key: Some(key.to_string()),
                payload: payload.to_vec(),
            });

            DeliveryReceipt {
                partition,
                offset: records.len() as i64 - 1,
            }
        };

        self.appended.notify_waiters();
        Ok(receipt)
    }
}

#[async_trait]
impl EventSubscriber for InMemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn EventConsumer>, BrokerError> {
        let mut state = self.lock()?;
        if state.faults.failing_subscribes > 0 {
            state.faults.failing_subscribes -= 1;
            return Err(BrokerError::Subscribe("injected subscribe failure".to_string()));
        }

        // A fresh member resumes from the group's committed offsets
        let positions = (0..self.partitions)
            .map(|partition| {
                let key = (group_id.to_string(), topic.to_string(), partition);
                (partition, state.committed.get(&key).copied().unwrap_or(0))
            })
            .collect();

        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            positions,
            next_partition: 0,
        }))
    }
}

/// Consumer group member of an `InMemoryBroker`.
///
/// Reads partitions round robin; within a partition strictly in offset order.
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    positions: HashMap<i32, i64>,
    next_partition: i32,
}

impl InMemoryConsumer {
    fn next_message(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        let mut state = self.broker.lock()?;
        if state.faults.failing_polls > 0 {
            state.faults.failing_polls -= 1;
            return Err(BrokerError::Transport("injected poll failure".to_string()));
        }

        let Some(log) = state.topics.get(&self.topic) else {
            return Ok(None);
        };

        let partitions = self.broker.partitions;
        for step in 0..partitions {
            let partition = (self.next_partition + step) % partitions;
            let position = self.positions.get(&partition).copied().unwrap_or(0);

            if let Some(record) = log[partition as usize].get(position as usize) {
                self.positions.insert(partition, position + 1);
                self.next_partition = (partition + 1) % partitions;
                return Ok(Some(BrokerMessage {
                    topic: self.topic.clone(),
                    partition,
                    offset: position,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl EventConsumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Registered before the check so an append in between is not missed
            let appended = self.broker.appended.clone();
            let notified = appended.notified();

            if let Some(message) = self.next_message()? {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut state = self.broker.lock()?;
        state.committed.insert(
            (self.group_id.clone(), message.topic.clone(), message.partition),
            message.offset + 1,
        );
        Ok(())
    }
}
