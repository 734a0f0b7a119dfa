//! Risk module
//!
//! The evaluator side of the pipeline: per-account daily totals, the
//! spending-limit rules, and the processor that turns created events into
//! verdicts.

pub mod daily_totals;
pub mod evaluator;
pub mod processor;

pub use daily_totals::{
    Accumulation, DailyKey, DailyTotalsStore, InMemoryDailyTotals, PgDailyTotals,
};
pub use evaluator::{
    Clock, Decision, DecisionReason, FixedClock, RuleEvaluator, RulesConfig, SystemClock,
};
pub use processor::CreatedEventProcessor;

/// Errors raised while evaluating a transaction
#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    /// Input the rules cannot score
    #[error("Invalid evaluation input: {0}")]
    InvalidInput(String),

    /// Daily totals backend failed
    #[error("Daily totals error: {0}")]
    Database(#[from] sqlx::Error),

    /// Daily totals backend unusable
    #[error("Daily totals unavailable: {0}")]
    Unavailable(String),
}
