//! PostgreSQL Store
//!
//! Production adapters for `TransactionStore` and `OutboxStore`.
//! The transaction row and its outbox entry are written in one database
//! transaction; outbox claiming relies on `FOR UPDATE SKIP LOCKED`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{Amount, DomainError, Transaction, TransactionStatus};

use super::{
    claim_order, NewOutboxEntry, OutboxEntry, OutboxStore, StatusUpdate, StoreError,
    TransactionStore,
};

type TransactionRow = (
    Uuid,
    Uuid,
    Uuid,
    i32,
    Decimal,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

type OutboxRow = (
    Uuid,
    Uuid,
    String,
    serde_json::Value,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    i32,
    Option<String>,
    Option<Uuid>,
);

fn transaction_from_row(row: TransactionRow) -> Result<Transaction, StoreError> {
    let (external_id, source, target, transfer_type_id, value, status, created_at, updated_at) =
        row;

    let value = Amount::new(value).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let status: TransactionStatus = status
        .parse()
        .map_err(|e: DomainError| StoreError::InvalidData(e.to_string()))?;

    Ok(Transaction::restore(
        external_id,
        source,
        target,
        transfer_type_id,
        value,
        status,
        created_at,
        updated_at,
    ))
}

fn outbox_from_row(row: OutboxRow) -> Result<OutboxEntry, StoreError> {
    let (
        id,
        aggregate_id,
        event_type,
        payload,
        status,
        created_at,
        next_attempt_at,
        sent_at,
        attempts,
        last_error,
        claim_token,
    ) = row;

    Ok(OutboxEntry {
        id,
        aggregate_id,
        event_type,
        payload,
        status: status.parse()?,
        created_at,
        next_attempt_at,
        sent_at,
        attempts,
        last_error,
        claim_token,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// =========================================================================
// Transactions
// =========================================================================

/// Transaction repository backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert_with_outbox(
        &self,
        transaction: &Transaction,
        idempotency_key: Option<&str>,
        entry: &NewOutboxEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions (
                external_id, source_account_id, target_account_id, transfer_type_id,
                value, status, idempotency_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transaction.external_id())
        .bind(transaction.source_account_id())
        .bind(transaction.target_account_id())
        .bind(transaction.transfer_type_id())
        .bind(transaction.value().value())
        .bind(transaction.status().as_str())
        .bind(idempotency_key)
        .bind(transaction.created_at())
        .bind(transaction.updated_at())
        .execute(&mut *tx)
        .await;

        match (inserted, idempotency_key) {
            (Err(e), Some(key)) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
            }
            (Err(e), _) => return Err(e.into()),
            (Ok(_), _) => {}
        }

        PgOutboxStore::enqueue(&mut *tx, entry).await?;

        // Dropping `tx` on any error above rolls back both rows
        tx.commit().await?;

        Ok(())
    }

    async fn find_by_id(&self, external_id: Uuid) -> Result<Option<Transaction>, StoreError> {
        let row: Option<TransactionRow> = sqlx::query_as(
            r#"
            SELECT external_id, source_account_id, target_account_id, transfer_type_id,
                   value, status, created_at, updated_at
            FROM transactions
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let row: Option<TransactionRow> = sqlx::query_as(
            r#"
            SELECT external_id, source_account_id, target_account_id, transfer_type_id,
                   value, status, created_at, updated_at
            FROM transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    async fn update_status(
        &self,
        external_id: Uuid,
        status: TransactionStatus,
    ) -> Result<StatusUpdate, StoreError> {
        if !status.is_final() {
            return Err(StoreError::InvalidData(format!(
                "cannot move transaction {} to {}",
                external_id, status
            )));
        }

        let rows_affected = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, updated_at = NOW()
            WHERE external_id = $1 AND status = 'pending'
            "#,
        )
        .bind(external_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 1 {
            return Ok(StatusUpdate::Applied);
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM transactions WHERE external_id = $1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Ok(StatusUpdate::NotFound),
            Some(current) => {
                let current: TransactionStatus = current
                    .parse()
                    .map_err(|e: DomainError| StoreError::InvalidData(e.to_string()))?;
                if current == status {
                    Ok(StatusUpdate::Unchanged)
                } else {
                    Ok(StatusUpdate::Conflict { current })
                }
            }
        }
    }
}

// =========================================================================
// Outbox
// =========================================================================

/// Outbox backed by the `outbox` table
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a pending entry on an open connection.
    ///
    /// Pass the connection of the transaction that writes the aggregate so
    /// both commit or roll back together.
    pub async fn enqueue(
        conn: &mut PgConnection,
        entry: &NewOutboxEntry,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO outbox (id, aggregate_id, event_type, payload, status, created_at)
            VALUES ($1, $2, $3, $4, 'pending', NOW())
            "#,
        )
        .bind(id)
        .bind(entry.aggregate_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .execute(&mut *conn)
        .await?;

        Ok(id)
    }

    /// Number of entries not yet sent
    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn dequeue_pending(
        &self,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        // The claim is the lease itself: pushing next_attempt_at forward hides
        // the rows from every other claimer until it expires.
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            WITH claimed AS (
                SELECT id, COALESCE(next_attempt_at, created_at) AS due_at
                FROM outbox
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY COALESCE(next_attempt_at, created_at) ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox o
            SET next_attempt_at = NOW() + make_interval(secs => $2),
                claim_token = $3
            FROM claimed c
            WHERE o.id = c.id
            RETURNING o.id, o.aggregate_id, o.event_type, o.payload, o.status,
                      o.created_at, c.due_at, o.sent_at, o.attempts, o.last_error,
                      o.claim_token
            "#,
        )
        .bind(limit)
        .bind(lease.as_secs_f64())
        .bind(Uuid::new_v4())
        .fetch_all(&self.pool)
        .await?;

        // RETURNING carries no order; `next_attempt_at` holds the pre-claim due time here
        let mut entries = rows
            .into_iter()
            .map(outbox_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(claim_order);

        Ok(entries)
    }

    async fn renew_claim(
        &self,
        id: Uuid,
        claim_token: Uuid,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE outbox
            SET next_attempt_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND claim_token = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(claim_token)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<bool, StoreError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'sent', sent_at = NOW(), next_attempt_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3,
                claim_token = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
