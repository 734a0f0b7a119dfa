//! antifraud - risk evaluation process
//!
//! Consumes `transactions.created.v1` from Kafka, applies the spending
//! limits and publishes `transactions.validated.v1`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use txflow::broker::{KafkaPublisher, KafkaSubscriber};
use txflow::config::Config;
use txflow::risk::{
    CreatedEventProcessor, DailyTotalsStore, InMemoryDailyTotals, PgDailyTotals, RuleEvaluator,
};
use txflow::workers::{shutdown_signal, ConsumerConfig, ConsumerLoop};
use txflow::{db, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing("antifraud=debug,txflow=debug");

    let config = Config::from_env()?;

    tracing::info!(
        per_transaction_limit = %config.rules.per_transaction_limit,
        daily_cap = %config.rules.daily_cap,
        "Starting antifraud"
    );

    let mut risk_pool = None;
    let totals: Arc<dyn DailyTotalsStore> = match &config.antifraud_database_url {
        Some(url) => {
            let pool =
                db::connect_with_schema(url, config.database_max_connections, db::RISK_TABLES)
                    .await?;
            risk_pool = Some(pool.clone());
            Arc::new(PgDailyTotals::new(pool))
        }
        None => {
            tracing::warn!("ANTIFRAUD_DATABASE_URL not set; daily totals kept in memory");
            Arc::new(InMemoryDailyTotals::new())
        }
    };

    let publisher = KafkaPublisher::new(&config.broker.bootstrap_servers)?;
    let subscriber = KafkaSubscriber::new(config.broker.bootstrap_servers.clone());

    let processor = CreatedEventProcessor::new(
        RuleEvaluator::new(totals, config.rules),
        Arc::new(publisher),
        config.broker.validated_topic.clone(),
    );
    let consumer = ConsumerLoop::new(
        Arc::new(subscriber),
        ConsumerConfig::new(
            config.broker.created_topic.clone(),
            config.broker.antifraud_group_id.clone(),
        ),
    );

    let shutdown = CancellationToken::new();
    let worker = processor.start(consumer, shutdown.clone());

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = worker.await {
        tracing::error!(error = %e, "Risk processor task failed");
    }
    if let Some(pool) = risk_pool {
        pool.close().await;
    }
    tracing::info!("Goodbye!");

    Ok(())
}
