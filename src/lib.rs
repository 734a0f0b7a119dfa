//! txflow Library
//!
//! Transaction pipeline: transactional outbox, broker workers, and the
//! spending-limit risk evaluator. Re-exports modules for the binaries and
//! integration tests.

pub mod api;
pub mod broker;
pub mod domain;
pub mod handlers;
pub mod risk;
pub mod store;
pub mod workers;

pub mod config;
pub mod db;
mod error;

pub use config::Config;
pub use domain::{Amount, AmountError, DomainError, Transaction, TransactionStatus};
pub use error::AppError;

/// Initialize tracing/logging
///
/// `RUST_LOG` overrides `default_filter`; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.to_string().into()),
    );

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
