//! Configuration module
//!
//! Loads configuration from environment variables.

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::PUBLISH_TIMEOUT;
use crate::domain::{TRANSACTION_CREATED_V1, TRANSACTION_VALIDATED_V1};
use crate::risk::RulesConfig;
use crate::workers::OutboxPublisherConfig;

/// Which broker the processes talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// In-process log; the risk processor runs inside the transactions process
    Memory,
    /// Kafka via rdkafka (feature `kafka`)
    Kafka,
}

impl FromStr for BrokerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerKind::Memory),
            "kafka" => Ok(BrokerKind::Kafka),
            _ => Err(ConfigError::InvalidValue("BROKER")),
        }
    }
}

/// Broker connection and topic settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub bootstrap_servers: String,
    pub created_topic: String,
    pub validated_topic: String,
    pub status_group_id: String,
    pub antifraud_group_id: String,
}

/// Outbox publisher tuning
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub claim_lease: Duration,
    pub retry_delay: Duration,
}

impl OutboxConfig {
    /// A claim must outlive the longest publish it covers
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size <= 0 {
            return Err(ConfigError::InvalidValue("OUTBOX_BATCH_SIZE"));
        }
        if self.claim_lease <= PUBLISH_TIMEOUT {
            return Err(ConfigError::InvalidValue("OUTBOX_CLAIM_LEASE_SECS"));
        }
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Transactions database URL; only the transactions process needs it
    pub database_url: Option<String>,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    pub broker: BrokerConfig,

    pub outbox: OutboxConfig,

    pub rules: RulesConfig,

    /// Daily totals database for the antifraud process; in memory when unset
    pub antifraud_database_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let broker = BrokerConfig {
            kind: vars.or("BROKER", "memory").parse()?,
            bootstrap_servers: vars.or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            created_topic: vars.or("KAFKA_TOPIC_CREATED", TRANSACTION_CREATED_V1),
            validated_topic: vars.or("KAFKA_TOPIC_VALIDATED", TRANSACTION_VALIDATED_V1),
            status_group_id: vars.or("KAFKA_STATUS_GROUP_ID", "status-worker"),
            antifraud_group_id: vars.or("KAFKA_ANTIFRAUD_GROUP_ID", "antifraud"),
        };

        let outbox = OutboxConfig {
            batch_size: vars.parse("OUTBOX_BATCH_SIZE", "200")?,
            poll_interval: Duration::from_millis(vars.parse("OUTBOX_POLL_INTERVAL_MS", "200")?),
            claim_lease: Duration::from_secs(vars.parse("OUTBOX_CLAIM_LEASE_SECS", "30")?),
            retry_delay: Duration::from_millis(vars.parse("OUTBOX_RETRY_DELAY_MS", "500")?),
        };
        outbox.validate()?;

        let rules = RulesConfig {
            per_transaction_limit: vars.parse::<Decimal>("RULES_PER_TXN_LIMIT", "2500")?,
            daily_cap: vars.parse::<Decimal>("RULES_DAILY_CAP", "20500")?,
        };
        if rules.per_transaction_limit <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue("RULES_PER_TXN_LIMIT"));
        }
        if rules.daily_cap <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue("RULES_DAILY_CAP"));
        }

        Ok(Self {
            database_url: vars.non_empty("DATABASE_URL"),
            database_max_connections: vars.parse("DATABASE_MAX_CONNECTIONS", "10")?,
            host: vars.or("HOST", "127.0.0.1"),
            port: vars.parse("PORT", "3000")?,
            environment: vars.or("ENVIRONMENT", "development"),
            broker,
            outbox,
            rules,
            antifraud_database_url: vars.non_empty("ANTIFRAUD_DATABASE_URL"),
        })
    }

    /// Transactions database URL, required by the transactions process
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingEnv("DATABASE_URL"))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Outbox publisher settings for the created-events topic
    pub fn outbox_publisher(&self) -> OutboxPublisherConfig {
        OutboxPublisherConfig {
            topic: self.broker.created_topic.clone(),
            batch_size: self.outbox.batch_size,
            poll_interval: self.outbox.poll_interval,
            claim_lease: self.outbox.claim_lease,
            retry_delay: self.outbox.retry_delay,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn or(&self, name: &str, default: &str) -> String {
        (self.0)(name).unwrap_or_else(|| default.to_string())
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: &str) -> Result<T, ConfigError> {
        self.or(name, default)
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),

    #[error("Broker '{0}' requires building with the `kafka` feature")]
    BrokerUnavailable(&'static str),
}
