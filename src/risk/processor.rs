//! Created Event Processor
//!
//! Risk side of the pipeline. Per message: decode, evaluate, publish the
//! verdict, then let the loop commit. The verdict is published before the
//! offset is committed, so a crash in between redelivers the event and
//! duplicates the verdict instead of losing it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerMessage, EventPublisher};
use crate::domain::{TransactionCreated, TransactionValidated};
use crate::workers::{sleep_or_shutdown, Backoff, ConsumerLoop, Disposition, MessageHandler};

use super::RuleEvaluator;

/// Turns `transactions.created.v1` messages into verdicts
pub struct CreatedEventProcessor {
    evaluator: RuleEvaluator,
    publisher: Arc<dyn EventPublisher>,
    verdict_topic: String,
    publish_retry: Backoff,
}

impl CreatedEventProcessor {
    pub fn new(
        evaluator: RuleEvaluator,
        publisher: Arc<dyn EventPublisher>,
        verdict_topic: impl Into<String>,
    ) -> Self {
        Self {
            evaluator,
            publisher,
            verdict_topic: verdict_topic.into(),
            publish_retry: Backoff::default(),
        }
    }

    /// Backoff between attempts to publish one verdict
    pub fn with_publish_retry(mut self, retry: Backoff) -> Self {
        self.publish_retry = retry;
        self
    }

    /// Run on `consumer` in the background until shutdown
    pub fn start(
        self,
        consumer: ConsumerLoop,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            consumer.run(&self, &shutdown).await;
        })
    }
}

#[async_trait]
impl MessageHandler for CreatedEventProcessor {
    async fn handle(&self, message: &BrokerMessage, shutdown: &CancellationToken) -> Disposition {
        let event = match TransactionCreated::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Discarding undecodable created event"
                );
                return Disposition::Commit;
            }
        };
        let id = event.transaction_external_id;

        let decision = match self
            .evaluator
            .evaluate(event.source_account_id, event.value, event.created_at)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    transaction_id = %id,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Evaluation failed; discarding event without verdict"
                );
                return Disposition::Commit;
            }
        };

        let verdict = TransactionValidated::new(
            id,
            decision.status,
            decision.reason.as_str(),
            decision.evaluated_at,
        );
        let payload = match serde_json::to_vec(&verdict) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(transaction_id = %id, error = %e, "Failed to encode verdict");
                return Disposition::Commit;
            }
        };

        // The daily total may already include this amount: retry the same
        // verdict rather than evaluating again
        let key = id.to_string();
        let mut retry = self.publish_retry.clone();
        loop {
            match self.publisher.publish(&self.verdict_topic, &key, &payload).await {
                Ok(_) => {
                    tracing::info!(
                        transaction_id = %id,
                        status = %decision.status,
                        reason = decision.reason.as_str(),
                        "Verdict published"
                    );
                    return Disposition::Commit;
                }
                Err(e) => {
                    let delay = retry.next_delay();
                    tracing::warn!(
                        transaction_id = %id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Verdict publish failed, retrying"
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return Disposition::Abandon;
                    }
                }
            }
        }
    }
}
