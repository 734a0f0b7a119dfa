//! Transaction entity
//!
//! A transaction is created `pending` by the ingestion path and reaches a
//! final status exactly once, when the risk verdict is applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Amount, DomainError};

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
}

impl TransactionStatus {
    /// Column/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Approved => "approved",
            TransactionStatus::Rejected => "rejected",
        }
    }

    /// Approved and rejected are terminal
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "approved" => Ok(TransactionStatus::Approved),
            "rejected" => Ok(TransactionStatus::Rejected),
            _ => Err(DomainError::UnknownStatus(s.to_string())),
        }
    }
}

/// Result of applying a status to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Moved from pending to the requested final status
    Applied,
    /// Already in the requested status; nothing changed
    Unchanged,
}

/// A money movement between two accounts.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    external_id: Uuid,
    source_account_id: Uuid,
    target_account_id: Uuid,
    transfer_type_id: i32,
    value: Amount,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a new pending transaction with a fresh external id
    pub fn create(
        source_account_id: Uuid,
        target_account_id: Uuid,
        transfer_type_id: i32,
        value: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: Uuid::new_v4(),
            source_account_id,
            target_account_id,
            transfer_type_id,
            value,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a transaction from persisted columns
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        external_id: Uuid,
        source_account_id: Uuid,
        target_account_id: Uuid,
        transfer_type_id: i32,
        value: Amount,
        status: TransactionStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id,
            source_account_id,
            target_account_id,
            transfer_type_id,
            value,
            status,
            created_at,
            updated_at,
        }
    }

    /// Apply a verdict status.
    ///
    /// Only `pending -> approved` and `pending -> rejected` move the state.
    /// Re-applying the current final status is a no-op so duplicate verdicts
    /// are harmless; any other change is refused.
    pub fn apply_status(
        &mut self,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, DomainError> {
        if status == self.status && status.is_final() {
            return Ok(StatusChange::Unchanged);
        }

        if self.status != TransactionStatus::Pending || !status.is_final() {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        self.updated_at = now;
        Ok(StatusChange::Applied)
    }

    pub fn external_id(&self) -> Uuid {
        self.external_id
    }

    pub fn source_account_id(&self) -> Uuid {
        self.source_account_id
    }

    pub fn target_account_id(&self) -> Uuid {
        self.target_account_id
    }

    pub fn transfer_type_id(&self) -> i32 {
        self.transfer_type_id
    }

    pub fn value(&self) -> Amount {
        self.value
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
