//! txflow - transactions service
//!
//! HTTP API, outbox publisher and verdict consumer. With `BROKER=memory`
//! the risk processor runs in this process too.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use txflow::api::{build_router, AppState};
use txflow::broker::{EventPublisher, EventSubscriber, InMemoryBroker};
use txflow::config::{BrokerKind, Config};
use txflow::risk::{
    CreatedEventProcessor, DailyTotalsStore, InMemoryDailyTotals, PgDailyTotals, RuleEvaluator,
};
use txflow::store::{PgOutboxStore, PgTransactionStore};
use txflow::workers::{
    shutdown_signal, ConsumerConfig, ConsumerLoop, OutboxPublisherWorker, StatusConsumerWorker,
};
use txflow::{db, init_tracing};

type BrokerPorts = (Arc<dyn EventPublisher>, Arc<dyn EventSubscriber>);

#[cfg(feature = "kafka")]
fn kafka_ports(config: &Config) -> anyhow::Result<BrokerPorts> {
    use txflow::broker::{KafkaPublisher, KafkaSubscriber};

    let publisher: Arc<dyn EventPublisher> =
        Arc::new(KafkaPublisher::new(&config.broker.bootstrap_servers)?);
    let subscriber: Arc<dyn EventSubscriber> =
        Arc::new(KafkaSubscriber::new(config.broker.bootstrap_servers.clone()));
    Ok((publisher, subscriber))
}

#[cfg(not(feature = "kafka"))]
fn kafka_ports(_config: &Config) -> anyhow::Result<BrokerPorts> {
    Err(txflow::config::ConfigError::BrokerUnavailable("kafka").into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing("txflow=debug,tower_http=debug");

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, broker = ?config.broker.kind, "Starting txflow");
    tracing::info!("Connecting to database...");

    let pool = db::connect(config.require_database_url()?, config.database_max_connections).await?;
    db::verify_connection(&pool).await?;

    if !db::check_schema(&pool, db::TRANSACTION_TABLES).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");

    let transactions = Arc::new(PgTransactionStore::new(pool.clone()));
    let outbox = Arc::new(PgOutboxStore::new(pool.clone()));

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();
    let mut risk_pool = None;

    let (publisher, subscriber): BrokerPorts = match config.broker.kind {
        BrokerKind::Kafka => kafka_ports(&config)?,
        BrokerKind::Memory => {
            if config.is_production() {
                tracing::warn!("In-memory broker only connects workers inside this process");
            }
            let broker = InMemoryBroker::new();

            let totals: Arc<dyn DailyTotalsStore> = match &config.antifraud_database_url {
                Some(url) => {
                    let pool = db::connect_with_schema(
                        url,
                        config.database_max_connections,
                        db::RISK_TABLES,
                    )
                    .await?;
                    risk_pool = Some(pool.clone());
                    Arc::new(PgDailyTotals::new(pool))
                }
                None => Arc::new(InMemoryDailyTotals::new()),
            };
            let processor = CreatedEventProcessor::new(
                RuleEvaluator::new(totals, config.rules),
                Arc::new(broker.clone()),
                config.broker.validated_topic.clone(),
            );
            let consumer = ConsumerLoop::new(
                Arc::new(broker.clone()),
                ConsumerConfig::new(
                    config.broker.created_topic.clone(),
                    config.broker.antifraud_group_id.clone(),
                ),
            );
            tracing::info!("Risk processor running in-process");
            workers.push(processor.start(consumer, shutdown.clone()));

            let publisher: Arc<dyn EventPublisher> = Arc::new(broker.clone());
            let subscriber: Arc<dyn EventSubscriber> = Arc::new(broker);
            (publisher, subscriber)
        }
    };

    workers.push(
        OutboxPublisherWorker::with_config(outbox, publisher, config.outbox_publisher())
            .start(shutdown.clone()),
    );
    workers.push(
        StatusConsumerWorker::new(
            transactions.clone(),
            subscriber,
            ConsumerConfig::new(
                config.broker.validated_topic.clone(),
                config.broker.status_group_id.clone(),
            ),
        )
        .start(shutdown.clone()),
    );

    let app = build_router(AppState::new(transactions));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // The server can also stop on its own; make sure the workers follow
    shutdown.cancel();
    tracing::info!("Server stopped, waiting for workers...");
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task failed");
        }
    }

    pool.close().await;
    if let Some(risk_pool) = risk_pool {
        risk_pool.close().await;
    }
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}
