//! Command Handlers module
//!
//! Handlers that orchestrate the ingestion side: creating transactions
//! together with their outbox entry, and applying risk verdicts.

mod apply_verdict;
mod commands;
mod create_transaction;


pub use apply_verdict::{ApplyOutcome, ApplyVerdictHandler};
pub use commands::*;
pub use create_transaction::CreateTransactionHandler;
