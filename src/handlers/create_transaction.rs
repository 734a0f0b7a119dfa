//! Create Transaction Handler
//!
//! Writes a new pending transaction and its `transactions.created.v1`
//! outbox entry in one atomic unit. An idempotency key already bound to a
//! transaction replays that transaction instead of creating another.

use chrono::Utc;
use std::sync::Arc;

use crate::domain::{Amount, Transaction, TransactionCreated, TRANSACTION_CREATED_V1};
use crate::error::AppError;
use crate::store::{NewOutboxEntry, StoreError, TransactionStore};

use super::{CreateTransactionCommand, CreateTransactionResult};

/// Handler for transaction creation
#[derive(Clone)]
pub struct CreateTransactionHandler {
    transactions: Arc<dyn TransactionStore>,
}

impl CreateTransactionHandler {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self { transactions }
    }

    /// Execute the create command
    pub async fn execute(
        &self,
        command: CreateTransactionCommand,
    ) -> Result<CreateTransactionResult, AppError> {
        let value = Amount::new(command.value)
            .map_err(|e| AppError::InvalidRequest(format!("Invalid value: {}", e)))?;

        if command.transfer_type_id <= 0 {
            return Err(AppError::InvalidRequest(
                "transferTypeId must be positive".to_string(),
            ));
        }

        let key = command
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        if let Some(key) = key {
            if let Some(existing) = self.transactions.find_by_idempotency_key(key).await? {
                tracing::info!(
                    transaction_id = %existing.external_id(),
                    idempotency_key = key,
                    "Replaying transaction for known idempotency key"
                );
                return Ok(CreateTransactionResult::replayed(&existing));
            }
        }

        let transaction = Transaction::create(
            command.source_account_id,
            command.target_account_id,
            command.transfer_type_id,
            value,
            Utc::now(),
        );
        let entry = NewOutboxEntry::new(
            transaction.external_id(),
            TRANSACTION_CREATED_V1,
            &TransactionCreated::from(&transaction),
        )?;

        match self
            .transactions
            .insert_with_outbox(&transaction, key, &entry)
            .await
        {
            Ok(()) => {}
            // Lost the race on the unique key: the winner's row is the answer
            Err(StoreError::DuplicateIdempotencyKey(key)) => {
                let existing = self
                    .transactions
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!("idempotency key {} bound but not found", key))
                    })?;
                return Ok(CreateTransactionResult::replayed(&existing));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            transaction_id = %transaction.external_id(),
            source_account_id = %transaction.source_account_id(),
            value = %transaction.value(),
            "Transaction created"
        );

        Ok(CreateTransactionResult::created(&transaction))
    }
}
