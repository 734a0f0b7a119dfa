//! Apply Verdict Handler
//!
//! Status-apply path for verdicts coming back from risk evaluation.

use std::sync::Arc;

use crate::domain::{TransactionStatus, TransactionValidated};
use crate::store::{StatusUpdate, StoreError, TransactionStore};

/// What happened to one verdict payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Pending transaction moved to its final status
    Applied,
    /// Duplicate verdict, status already set
    Unchanged,
    /// Transaction already final with another status; left alone
    Conflict {
        current: TransactionStatus,
        requested: TransactionStatus,
    },
    /// Unknown transaction id
    NotFound,
    /// Payload could not be decoded; discarded
    Skipped(String),
}

/// Handler applying `TransactionValidated` payloads to the store
#[derive(Clone)]
pub struct ApplyVerdictHandler {
    transactions: Arc<dyn TransactionStore>,
}

impl ApplyVerdictHandler {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self { transactions }
    }

    /// Decode and apply one verdict.
    ///
    /// Poison payloads and unknown ids are reported as outcomes. Only store
    /// failures are errors, and those are worth retrying.
    pub async fn execute(&self, payload: &[u8]) -> Result<ApplyOutcome, StoreError> {
        let verdict = match TransactionValidated::decode(payload) {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable verdict");
                return Ok(ApplyOutcome::Skipped(e.to_string()));
            }
        };

        let id = verdict.transaction_external_id;
        let requested: TransactionStatus = verdict.status.into();

        let outcome = match self.transactions.update_status(id, requested).await? {
            StatusUpdate::Applied => {
                tracing::info!(
                    transaction_id = %id,
                    status = %requested,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "Transaction status updated"
                );
                ApplyOutcome::Applied
            }
            StatusUpdate::Unchanged => {
                tracing::debug!(transaction_id = %id, status = %requested, "Duplicate verdict ignored");
                ApplyOutcome::Unchanged
            }
            StatusUpdate::Conflict { current } => {
                tracing::warn!(
                    transaction_id = %id,
                    current = %current,
                    requested = %requested,
                    "Verdict conflicts with final status; keeping current"
                );
                ApplyOutcome::Conflict { current, requested }
            }
            StatusUpdate::NotFound => {
                tracing::warn!(transaction_id = %id, "Verdict for unknown transaction");
                ApplyOutcome::NotFound
            }
        };

        Ok(outcome)
    }
}
