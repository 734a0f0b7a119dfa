//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use thiserror::Error;

use super::TransactionStatus;

/// Business rule violations raised by the transaction model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Status change not allowed by the transaction state machine
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Unknown status value
    #[error("Unknown transaction status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    /// Check if this is a state conflict (status already final)
    pub fn is_conflict_error(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}
