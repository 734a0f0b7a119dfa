//! Kafka Broker
//!
//! `rdkafka` adapters for the broker ports.
//!
//! - Producer: idempotent, `acks=all`, so an acknowledged publish is durable
//! - Consumer: `StreamConsumer` with auto-commit off; offsets are committed
//!   explicitly after the handler finishes

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as KafkaMessage, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;

use super::{
    BrokerError, BrokerMessage, DeliveryReceipt, EventConsumer, EventPublisher, EventSubscriber,
    PUBLISH_TIMEOUT,
};

/// Producer side
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(bootstrap_servers: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::Config(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let (partition, offset) = self
            .producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| BrokerError::Transport(format!("Failed to send: {}", e)))?;

        Ok(DeliveryReceipt { partition, offset })
    }
}

/// Builds consumer group members
#[derive(Debug, Clone)]
pub struct KafkaSubscriber {
    bootstrap_servers: String,
}

impl KafkaSubscriber {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
        }
    }
}

#[async_trait]
impl EventSubscriber for KafkaSubscriber {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn EventConsumer>, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError::Config(format!("Failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe: {}", e)))?;

        Ok(Box::new(KafkaConsumer {
            consumer: Arc::new(consumer),
        }))
    }
}

/// Consumer group member backed by a `StreamConsumer`
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl EventConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(BrokerError::Transport(format!("Failed to receive: {}", e))),
            Ok(Ok(message)) => Ok(Some(BrokerMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
        }
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| BrokerError::Transport(format!("Invalid offset: {}", e)))?;

        // Sync commit blocks on the broker round trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Transport(format!("Commit task failed: {}", e)))?
            .map_err(|e| BrokerError::Transport(format!("Failed to commit: {}", e)))
    }
}
