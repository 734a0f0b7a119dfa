//! Background Workers
//!
//! Long-running loops bridging the store and the broker. Every loop
//! observes a shared `CancellationToken` and only stops between iterations,
//! so a publish/mark-sent or handle/commit pair is never cut in half.

pub mod outbox_publisher;
pub mod status_consumer;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerMessage, EventSubscriber};

pub use outbox_publisher::{OutboxPublisherConfig, OutboxPublisherWorker, PublishReport};
pub use status_consumer::StatusConsumerWorker;

// =========================================================================
// Backoff
// =========================================================================

/// Increasing delay sequence; the last step repeats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    steps: Vec<Duration>,
    attempt: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ])
    }
}

impl Backoff {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps, attempt: 0 }
    }

    /// Same delay for every attempt
    pub fn constant(delay: Duration) -> Self {
        Self::new(vec![delay])
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let Some(last) = self.steps.last() else {
            return Duration::ZERO;
        };
        let delay = self.steps.get(self.attempt).unwrap_or(last);
        self.attempt = self.attempt.saturating_add(1);
        *delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `false` on shutdown.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

// =========================================================================
// Consumer loop
// =========================================================================

/// What to do with a message once its handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled or discarded as poison; commit the offset
    Commit,
    /// Interrupted by shutdown; leave the offset for redelivery
    Abandon,
}

/// Per-message logic run by a `ConsumerLoop`
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BrokerMessage, shutdown: &CancellationToken) -> Disposition;
}

/// Consumer loop settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    /// Bounded wait per poll
    pub poll_timeout: Duration,
    /// Pause after an empty poll
    pub idle_delay: Duration,
    /// Delays between reconnect attempts
    pub reconnect: Backoff,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            poll_timeout: Duration::from_secs(1),
            idle_delay: Duration::from_millis(200),
            reconnect: Backoff::default(),
        }
    }
}

/// Subscribe, then poll, handle and commit until shutdown.
///
/// Subscribe, poll and commit faults drop the consumer and resubscribe after
/// the next backoff step; the new member resumes from the committed offset.
/// A successful subscription resets the backoff. A subscribe error that is
/// not retryable (bad client configuration) stops the loop.
pub struct ConsumerLoop {
    subscriber: Arc<dyn EventSubscriber>,
    config: ConsumerConfig,
}

impl ConsumerLoop {
    pub fn new(subscriber: Arc<dyn EventSubscriber>, config: ConsumerConfig) -> Self {
        Self { subscriber, config }
    }

    pub async fn run(&self, handler: &dyn MessageHandler, shutdown: &CancellationToken) {
        let topic = self.config.topic.as_str();
        let group_id = self.config.group_id.as_str();
        let mut backoff = self.config.reconnect.clone();

        tracing::info!(topic, group_id, "Consumer loop started");

        'connect: while !shutdown.is_cancelled() {
            let mut consumer = match self.subscriber.subscribe(topic, group_id).await {
                Ok(consumer) => {
                    backoff.reset();
                    tracing::info!(topic, group_id, "Subscribed");
                    consumer
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(topic, group_id, error = %e, "Subscribe failed permanently");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        topic,
                        group_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Subscribe failed"
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let polled = tokio::select! {
                    _ = shutdown.cancelled() => break 'connect,
                    polled = consumer.poll(self.config.poll_timeout) => polled,
                };

                let message = match polled {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        if !sleep_or_shutdown(self.config.idle_delay, shutdown).await {
                            break 'connect;
                        }
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(topic, group_id, error = %e, "Poll failed, reconnecting");
                        break;
                    }
                };

                match handler.handle(&message, shutdown).await {
                    Disposition::Commit => {
                        if let Err(e) = consumer.commit(&message).await {
                            tracing::warn!(
                                topic,
                                partition = message.partition,
                                offset = message.offset,
                                error = %e,
                                "Commit failed, reconnecting"
                            );
                            break;
                        }
                    }
                    Disposition::Abandon => {
                        tracing::info!(
                            topic,
                            partition = message.partition,
                            offset = message.offset,
                            "Message left uncommitted for redelivery"
                        );
                        break 'connect;
                    }
                }
            }

            drop(consumer);
            let delay = backoff.next_delay();
            if !sleep_or_shutdown(delay, shutdown).await {
                break;
            }
        }

        tracing::info!(topic, group_id, "Consumer loop stopped");
    }
}
