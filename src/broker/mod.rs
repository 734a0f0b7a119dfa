//! Broker module
//!
//! Ports for the durable, partitioned log that carries integration events.
//! Messages are keyed by transaction id so all events for one transaction
//! land on the same partition. Consumers commit an offset only after the
//! message has been fully handled.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use std::time::Duration;

pub use memory::InMemoryBroker;

/// Longest a publisher waits for the broker to acknowledge one message
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaPublisher, KafkaSubscriber};

/// Errors raised by broker adapters
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Broker unreachable or rejected the request
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// No acknowledgement within the deadline
    #[error("Broker timed out: {0}")]
    Timeout(String),

    /// Could not join the consumer group
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Client configuration rejected
    #[error("Broker configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::Timeout(_) | BrokerError::Subscribe(_)
        )
    }
}

/// Message read from a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Where an acknowledged publish landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Publishes keyed messages and waits for the broker acknowledgement
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError>;
}

/// One member of a consumer group
#[async_trait]
pub trait EventConsumer: Send {
    /// Wait up to `timeout` for the next message
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Commit the position after `message`
    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError>;
}

/// Creates consumer group members
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn EventConsumer>, BrokerError>;
}
