//! Status Consumer
//!
//! Consumes verdicts and applies them to the transaction store. Poison
//! messages and unknown ids are committed and forgotten. Transient store
//! failures retry the same message with backoff so a verdict is never lost
//! to a database blip; any other store error is logged and the message
//! committed, since retrying it cannot succeed.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerMessage, EventSubscriber};
use crate::handlers::ApplyVerdictHandler;
use crate::store::TransactionStore;

use super::{sleep_or_shutdown, Backoff, ConsumerConfig, ConsumerLoop, Disposition, MessageHandler};

/// Long-running verdict consumer
pub struct StatusConsumerWorker {
    consumer: ConsumerLoop,
    handler: StatusMessageHandler,
}

impl StatusConsumerWorker {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        subscriber: Arc<dyn EventSubscriber>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            consumer: ConsumerLoop::new(subscriber, config),
            handler: StatusMessageHandler {
                apply: ApplyVerdictHandler::new(transactions),
                retry: Backoff::default(),
            },
        }
    }

    /// Backoff between attempts to write one verdict
    pub fn with_store_retry(mut self, retry: Backoff) -> Self {
        self.handler.retry = retry;
        self
    }

    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        self.consumer.run(&self.handler, &shutdown).await;
    }
}

struct StatusMessageHandler {
    apply: ApplyVerdictHandler,
    retry: Backoff,
}

#[async_trait]
impl MessageHandler for StatusMessageHandler {
    async fn handle(&self, message: &BrokerMessage, shutdown: &CancellationToken) -> Disposition {
        let mut retry = self.retry.clone();

        loop {
            match self.apply.execute(&message.payload).await {
                Ok(outcome) => {
                    tracing::debug!(
                        partition = message.partition,
                        offset = message.offset,
                        outcome = ?outcome,
                        "Verdict handled"
                    );
                    return Disposition::Commit;
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Status write failed permanently, dropping verdict"
                    );
                    return Disposition::Commit;
                }
                Err(e) => {
                    let delay = retry.next_delay();
                    tracing::warn!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Status write failed, retrying"
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return Disposition::Abandon;
                    }
                }
            }
        }
    }
}
