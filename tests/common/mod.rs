//! Common test utilities
#![allow(dead_code)]

use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use txflow::broker::InMemoryBroker;
use txflow::domain::{TRANSACTION_CREATED_V1, TRANSACTION_VALIDATED_V1};
use txflow::handlers::{CreateTransactionCommand, CreateTransactionHandler};
use txflow::risk::{CreatedEventProcessor, InMemoryDailyTotals, RuleEvaluator, RulesConfig};
use txflow::store::{InMemoryStore, TransactionStore};
use txflow::workers::{
    Backoff, ConsumerConfig, ConsumerLoop, OutboxPublisherConfig, OutboxPublisherWorker,
    StatusConsumerWorker,
};
use txflow::TransactionStatus;

pub const STATUS_GROUP: &str = "status-worker";
pub const ANTIFRAUD_GROUP: &str = "antifraud";

/// Poll `check` every 10ms for up to 5s
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn fast_consumer(topic: &str, group: &str) -> ConsumerConfig {
    ConsumerConfig {
        poll_timeout: Duration::from_millis(20),
        idle_delay: Duration::from_millis(5),
        reconnect: Backoff::constant(Duration::from_millis(5)),
        ..ConsumerConfig::new(topic, group)
    }
}

/// Both processes wired together over the in-memory store and broker
pub struct Pipeline {
    pub store: InMemoryStore,
    pub broker: InMemoryBroker,
    pub totals: InMemoryDailyTotals,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start() -> Self {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let totals = InMemoryDailyTotals::new();
        let shutdown = CancellationToken::new();

        let publisher = OutboxPublisherWorker::with_config(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            OutboxPublisherConfig {
                poll_interval: Duration::from_millis(5),
                retry_delay: Duration::from_millis(10),
                ..OutboxPublisherConfig::default()
            },
        );

        let processor = CreatedEventProcessor::new(
            RuleEvaluator::new(Arc::new(totals.clone()), RulesConfig::default()),
            Arc::new(broker.clone()),
            TRANSACTION_VALIDATED_V1,
        )
        .with_publish_retry(Backoff::constant(Duration::from_millis(5)));
        let risk_consumer = ConsumerLoop::new(
            Arc::new(broker.clone()),
            fast_consumer(TRANSACTION_CREATED_V1, ANTIFRAUD_GROUP),
        );

        let status = StatusConsumerWorker::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            fast_consumer(TRANSACTION_VALIDATED_V1, STATUS_GROUP),
        )
        .with_store_retry(Backoff::constant(Duration::from_millis(5)));

        let workers = vec![
            publisher.start(shutdown.clone()),
            processor.start(risk_consumer, shutdown.clone()),
            status.start(shutdown.clone()),
        ];

        Self {
            store,
            broker,
            totals,
            shutdown,
            workers,
        }
    }

    pub fn handler(&self) -> CreateTransactionHandler {
        CreateTransactionHandler::new(Arc::new(self.store.clone()))
    }

    /// Create a transaction from `source` and return its id
    pub async fn create(&self, source: Uuid, value: Decimal) -> Uuid {
        let command = CreateTransactionCommand::new(source, Uuid::new_v4(), 1, value)
            .with_idempotency_key(Uuid::new_v4().to_string());
        self.handler()
            .execute(command)
            .await
            .expect("create transaction")
            .transaction_external_id
    }

    pub async fn status(&self, id: Uuid) -> Option<TransactionStatus> {
        self.store
            .find_by_id(id)
            .await
            .expect("find transaction")
            .map(|tx| tx.status())
    }

    /// Wait until `id` leaves `pending` and return its final status
    pub async fn final_status(&self, id: Uuid) -> TransactionStatus {
        let reached = wait_until(move || async move {
            matches!(self.status(id).await, Some(status) if status.is_final())
        })
        .await;
        assert!(reached, "transaction {} never left pending", id);
        self.status(id).await.expect("transaction exists")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            worker.await.expect("worker panicked");
        }
    }
}

/// Setup test database - apply the schema and truncate tables
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    for migration in [
        include_str!("../../migrations/0001_init.sql"),
        include_str!("../../migrations/0002_outbox_claim_token.sql"),
    ] {
        pool.execute(migration).await.expect("Failed to apply schema");
    }

    sqlx::query("TRUNCATE TABLE transactions, outbox, daily_totals")
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

    pool
}
