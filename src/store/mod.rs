//! Store module
//!
//! Durable state of the ingestion side: transactions and the transactional
//! outbox. The traits are the ports; `postgres` is the production adapter and
//! `memory` backs tests and single-process runs.

mod error;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{Transaction, TransactionStatus};

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::{PgOutboxStore, PgTransactionStore};

/// Delivery state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            other => Err(StoreError::InvalidData(format!("outbox status '{}'", other))),
        }
    }
}

/// Event waiting to be enqueued alongside its aggregate
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEntry {
    /// Serialize an event into a new outbox entry
    pub fn new<E: serde::Serialize>(
        aggregate_id: Uuid,
        event_type: &str,
        event: &E,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            aggregate_id,
            event_type: event_type.to_string(),
            payload: serde_json::to_value(event)?,
        })
    }
}

/// Outbox row
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Token of the claim currently holding the entry
    pub claim_token: Option<Uuid>,
}

/// Outcome of a status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Exactly one pending row moved to the new status
    Applied,
    /// The row already carried this status
    Unchanged,
    /// The row is final with a different status and was left alone
    Conflict { current: TransactionStatus },
    /// No row with this id
    NotFound,
}

impl StatusUpdate {
    /// The verdict is reflected in the store
    pub fn is_success(&self) -> bool {
        matches!(self, StatusUpdate::Applied | StatusUpdate::Unchanged)
    }
}

/// Durable record of transactions
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a pending transaction and enqueue its outbox entry in one atomic unit.
    ///
    /// Fails with `StoreError::DuplicateIdempotencyKey` when the key is already bound.
    async fn insert_with_outbox(
        &self,
        transaction: &Transaction,
        idempotency_key: Option<&str>,
        entry: &NewOutboxEntry,
    ) -> Result<(), StoreError>;

    /// Find a transaction by its external id
    async fn find_by_id(&self, external_id: Uuid) -> Result<Option<Transaction>, StoreError>;

    /// Find the transaction created with an idempotency key
    async fn find_by_idempotency_key(&self, key: &str)
        -> Result<Option<Transaction>, StoreError>;

    /// Move a pending transaction to a final status
    async fn update_status(
        &self,
        external_id: Uuid,
        status: TransactionStatus,
    ) -> Result<StatusUpdate, StoreError>;
}

/// Durable queue of not-yet-published events.
///
/// Entries are enqueued by `TransactionStore::insert_with_outbox`, inside the
/// same atomic unit as the aggregate write.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due pending entries for `lease`.
    ///
    /// Claimed entries are invisible to other claimers until the lease runs
    /// out, which is also how a crashed claimer gives its rows back. Every
    /// returned entry carries the token of this claim.
    async fn dequeue_pending(
        &self,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Extend the lease of a claimed entry.
    ///
    /// Returns `false` when the entry is no longer pending under `claim_token`,
    /// i.e. another claimer took it over after the lease ran out.
    async fn renew_claim(
        &self,
        id: Uuid,
        claim_token: Uuid,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Mark an entry sent. Returns `false` if it was already sent (no-op).
    async fn mark_sent(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Record a failed publish attempt and schedule the next one
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Claim ordering: due time (falling back to creation), then creation time
pub(crate) fn claim_order(entry: &OutboxEntry) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        entry.next_attempt_at.unwrap_or(entry.created_at),
        entry.created_at,
    )
}
