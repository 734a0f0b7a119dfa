//! Outbox Publisher
//!
//! Drains the outbox into the broker: claim a batch, publish each entry
//! keyed by its aggregate id, mark it sent on acknowledgement. A failed
//! publish leaves the entry pending with a retry time. A crash between the
//! acknowledgement and `mark_sent` republishes the entry later, so delivery
//! is at-least-once.
//!
//! Each entry's claim is renewed right before its publish, and a publish is
//! cut off after `publish_timeout`. With `claim_lease` longer than that, an
//! entry is never in flight from two publishers at once; an entry whose claim
//! was taken over after the batch lease ran out is skipped.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, EventPublisher, PUBLISH_TIMEOUT};
use crate::domain::TRANSACTION_CREATED_V1;
use crate::store::{OutboxEntry, OutboxStore, StoreError};

use super::sleep_or_shutdown;

/// Configuration for the outbox publisher
#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    /// Destination topic
    pub topic: String,
    /// Entries claimed per poll (default: 200)
    pub batch_size: i64,
    /// Sleep after an empty or failed poll (default: 200ms)
    pub poll_interval: Duration,
    /// How long a claim hides entries from other publishers (default: 30s)
    pub claim_lease: Duration,
    /// Delay before a failed entry is retried (default: 500ms)
    pub retry_delay: Duration,
    /// Longest wait for a broker acknowledgement (default: 10s)
    pub publish_timeout: Duration,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            topic: TRANSACTION_CREATED_V1.to_string(),
            batch_size: 200,
            poll_interval: Duration::from_millis(200),
            claim_lease: Duration::from_secs(30),
            retry_delay: Duration::from_millis(500),
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }
}

/// Outcome of one claim/publish pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Claimed, then taken over by another publisher before being sent
    pub skipped: usize,
}

enum EntryOutcome {
    Sent,
    Failed,
    Skipped,
}

/// Outbox publisher - moves pending entries to the broker
pub struct OutboxPublisherWorker {
    outbox: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxPublisherConfig,
}

impl OutboxPublisherWorker {
    pub fn new(outbox: Arc<dyn OutboxStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self::with_config(outbox, publisher, OutboxPublisherConfig::default())
    }

    pub fn with_config(
        outbox: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self {
            outbox,
            publisher,
            config,
        }
    }

    /// Start the worker in the background
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Run until shutdown. A started batch always completes first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(topic = %self.config.topic, "Outbox publisher started");

        while !shutdown.is_cancelled() {
            let idle = match self.publish_batch().await {
                Ok(report) => report.claimed == 0,
                Err(e) => {
                    tracing::error!(error = %e, "Outbox claim failed");
                    true
                }
            };

            if idle && !sleep_or_shutdown(self.config.poll_interval, &shutdown).await {
                break;
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    /// Claim one batch and publish it
    pub async fn publish_batch(&self) -> Result<PublishReport, StoreError> {
        let entries = self
            .outbox
            .dequeue_pending(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = PublishReport {
            claimed: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            match self.publish_entry(entry).await {
                EntryOutcome::Sent => report.sent += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Skipped => report.skipped += 1,
            }
        }

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Outbox batch processed"
            );
        }

        Ok(report)
    }

    /// Extend the claim on `entry`. `false` when it is no longer ours to publish.
    async fn hold_claim(&self, entry: &OutboxEntry) -> bool {
        let Some(token) = entry.claim_token else {
            return true;
        };

        match self
            .outbox
            .renew_claim(entry.id, token, self.config.claim_lease)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(outbox_id = %entry.id, "Claim taken over, skipping entry");
                false
            }
            Err(e) => {
                tracing::warn!(
                    outbox_id = %entry.id,
                    error = %e,
                    "Could not renew claim, leaving entry for a later pass"
                );
                false
            }
        }
    }

    async fn publish_entry(&self, entry: &OutboxEntry) -> EntryOutcome {
        if !self.hold_claim(entry).await {
            return EntryOutcome::Skipped;
        }

        let key = entry.aggregate_id.to_string();

        let published = match serde_json::to_vec(&entry.payload) {
            Ok(payload) => {
                let publish = self.publisher.publish(&self.config.topic, &key, &payload);
                match tokio::time::timeout(self.config.publish_timeout, publish).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(BrokerError::Timeout(format!(
                        "no acknowledgement within {}ms",
                        self.config.publish_timeout.as_millis()
                    ))
                    .to_string()),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(receipt) => {
                // Already acknowledged by the broker; a lost mark_sent only
                // means the lease expires and the entry goes out again
                match self.outbox.mark_sent(entry.id).await {
                    Ok(_) => {
                        tracing::info!(
                            outbox_id = %entry.id,
                            aggregate_id = %entry.aggregate_id,
                            event_type = %entry.event_type,
                            partition = receipt.partition,
                            offset = receipt.offset,
                            "Outbox entry published"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            outbox_id = %entry.id,
                            error = %e,
                            "Published but mark_sent failed; entry will be republished"
                        );
                    }
                }
                EntryOutcome::Sent
            }
            Err(error) => {
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(self.config.retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::milliseconds(500));

                tracing::warn!(
                    outbox_id = %entry.id,
                    aggregate_id = %entry.aggregate_id,
                    attempts = entry.attempts + 1,
                    error = %error,
                    "Outbox publish failed"
                );

                if let Err(e) = self.outbox.mark_failed(entry.id, &error, retry_at).await {
                    tracing::error!(outbox_id = %entry.id, error = %e, "Failed to record publish failure");
                }
                EntryOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliveryReceipt, InMemoryBroker};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use crate::domain::{Amount, Transaction, TransactionCreated};
    use crate::store::{InMemoryStore, NewOutboxEntry, OutboxStatus, TransactionStore};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const TOPIC: &str = "created";

    async fn seed(store: &InMemoryStore) -> Uuid {
        let tx = Transaction::create(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            Amount::new(dec!(10)).unwrap(),
            Utc::now(),
        );
        let entry = NewOutboxEntry::new(
            tx.external_id(),
            TRANSACTION_CREATED_V1,
            &TransactionCreated::from(&tx),
        )
        .unwrap();
        store.insert_with_outbox(&tx, None, &entry).await.unwrap();
        tx.external_id()
    }

    fn worker(store: &InMemoryStore, broker: &InMemoryBroker) -> OutboxPublisherWorker {
        OutboxPublisherWorker::with_config(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            OutboxPublisherConfig {
                topic: TOPIC.to_string(),
                retry_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_config_default() {
        let config = OutboxPublisherConfig::default();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.claim_lease, Duration::from_secs(30));
        assert!(config.claim_lease > config.publish_timeout);
    }

    /// Acknowledges every publish after a fixed delay
    struct SlowPublisher {
        broker: InMemoryBroker,
        delay: Duration,
    }

    #[async_trait]
    impl EventPublisher for SlowPublisher {
        async fn publish(
            &self,
            topic: &str,
            key: &str,
            payload: &[u8],
        ) -> Result<DeliveryReceipt, BrokerError> {
            tokio::time::sleep(self.delay).await;
            self.broker.publish(topic, key, payload).await
        }
    }

    fn slow_worker(
        store: &InMemoryStore,
        broker: &InMemoryBroker,
        delay: Duration,
        config: OutboxPublisherConfig,
    ) -> OutboxPublisherWorker {
        OutboxPublisherWorker::with_config(
            Arc::new(store.clone()),
            Arc::new(SlowPublisher {
                broker: broker.clone(),
                delay,
            }),
            config,
        )
    }

    #[tokio::test]
    async fn test_publishes_keyed_by_aggregate_and_marks_sent() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let id = seed(&store).await;

        let report = worker(&store, &broker).publish_batch().await.unwrap();

        assert_eq!(
            report,
            PublishReport {
                claimed: 1,
                sent: 1,
                failed: 0,
                skipped: 0
            }
        );
        let messages = broker.messages(TOPIC);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, Some(id.to_string()));
        let event = TransactionCreated::decode(&messages[0].payload).unwrap();
        assert_eq!(event.transaction_external_id, id);
        assert_eq!(store.outbox_entries()[0].status, OutboxStatus::Sent);
    }

    #[tokio::test]
    async fn test_failed_publish_stays_pending_and_retries() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        seed(&store).await;
        let worker = worker(&store, &broker);

        broker.fail_next_publishes(1);
        let first = worker.publish_batch().await.unwrap();

        assert_eq!(first.failed, 1);
        let entry = &store.outbox_entries()[0];
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.is_some());
        assert!(broker.messages(TOPIC).is_empty());

        let second = worker.publish_batch().await.unwrap();

        assert_eq!(second.sent, 1);
        assert_eq!(broker.messages(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_lost_mark_sent_republishes_after_lease() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        seed(&store).await;
        let worker = worker(&store, &broker);

        store.fail_next_mark_sent(1);
        worker.publish_batch().await.unwrap();
        assert_eq!(store.pending_count(), 1);

        // Still leased: nothing to claim
        assert_eq!(worker.publish_batch().await.unwrap().claimed, 0);

        store.expire_leases();
        worker.publish_batch().await.unwrap();

        assert_eq!(broker.messages(TOPIC).len(), 2);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_is_reported_not_fatal() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        store.set_unavailable(true);

        let result = worker(&store, &broker).publish_batch().await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        seed(&store).await;
        let shutdown = CancellationToken::new();

        let handle = worker(&store, &broker).start(shutdown.clone());
        for _ in 0..100 {
            if store.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(broker.messages(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_publish_times_out_and_stays_pending() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        seed(&store).await;
        let worker = slow_worker(
            &store,
            &broker,
            Duration::from_secs(5),
            OutboxPublisherConfig {
                topic: TOPIC.to_string(),
                publish_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let report = worker.publish_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        let entry = &store.outbox_entries()[0];
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert!(entry.last_error.as_deref().unwrap().contains("timed out"));
        assert!(broker.messages(TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_after_lease_invalidates_stale_claim() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        seed(&store).await;

        // A claimer whose lease ran out before it got to the entry
        let stale = store
            .dequeue_pending(10, Duration::from_secs(30))
            .await
            .unwrap();
        store.expire_leases();

        let report = worker(&store, &broker).publish_batch().await.unwrap();
        assert_eq!(report.sent, 1);

        let token = stale[0].claim_token.unwrap();
        assert!(!store
            .renew_claim(stale[0].id, token, Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(broker.messages(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_two_publishers_with_expiring_lease_send_each_entry_once() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let mut ids = HashSet::new();
        for _ in 0..8 {
            ids.insert(seed(&store).await);
        }

        // One publisher needs ~240ms for the whole batch, well past the lease
        let config = OutboxPublisherConfig {
            topic: TOPIC.to_string(),
            poll_interval: Duration::from_millis(10),
            claim_lease: Duration::from_millis(150),
            publish_timeout: Duration::from_millis(100),
            retry_delay: Duration::ZERO,
            ..Default::default()
        };
        let delay = Duration::from_millis(30);
        let shutdown = CancellationToken::new();
        let first = slow_worker(&store, &broker, delay, config.clone()).start(shutdown.clone());
        let second = slow_worker(&store, &broker, delay, config).start(shutdown.clone());

        for _ in 0..200 {
            if store.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Let any publish still in flight land
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        first.await.unwrap();
        second.await.unwrap();

        let messages = broker.messages(TOPIC);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(messages.len(), ids.len());
        let keys: HashSet<Uuid> = messages
            .iter()
            .map(|m| m.key.as_deref().unwrap().parse().unwrap())
            .collect();
        assert_eq!(keys, ids);
    }
}
