//! Command definitions
//!
//! Commands represent intentions to change the system state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Transaction, TransactionStatus};

// =========================================================================
// CreateTransactionCommand
// =========================================================================

/// Command to create a pending transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionCommand {
    pub source_account_id: Uuid,
    pub target_account_id: Uuid,
    pub transfer_type_id: i32,
    pub value: Decimal,
    /// Client token; a repeat returns the transaction first created with it
    pub idempotency_key: Option<String>,
}

impl CreateTransactionCommand {
    pub fn new(
        source_account_id: Uuid,
        target_account_id: Uuid,
        transfer_type_id: i32,
        value: Decimal,
    ) -> Self {
        Self {
            source_account_id,
            target_account_id,
            transfer_type_id,
            value,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of transaction creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTransactionResult {
    pub transaction_external_id: Uuid,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    /// The idempotency key was already bound; nothing new was written
    pub replayed: bool,
}

impl CreateTransactionResult {
    pub(crate) fn created(tx: &Transaction) -> Self {
        Self {
            transaction_external_id: tx.external_id(),
            status: tx.status(),
            created_at: tx.created_at(),
            replayed: false,
        }
    }

    pub(crate) fn replayed(tx: &Transaction) -> Self {
        Self {
            replayed: true,
            ..Self::created(tx)
        }
    }
}
