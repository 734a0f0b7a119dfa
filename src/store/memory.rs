//! In-memory Store
//!
//! Single-process implementation of both store ports. One mutex guards
//! transactions and outbox together, which gives `insert_with_outbox` and
//! the claim the same atomicity the database provides.
//!
//! The fault switches let tests simulate crashes between publish and
//! `mark_sent`, and an unreachable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{StatusChange, Transaction, TransactionStatus};

use super::{
    claim_order, NewOutboxEntry, OutboxEntry, OutboxStatus, OutboxStore, StatusUpdate,
    StoreError, TransactionStore,
};

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_mark_sent: u32,
    failing_status_updates: u32,
}

#[derive(Debug, Default)]
struct State {
    transactions: HashMap<Uuid, Transaction>,
    idempotency_keys: HashMap<String, Uuid>,
    outbox: HashMap<Uuid, OutboxEntry>,
    faults: Faults,
}

impl State {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }
}

/// Transaction and outbox store held in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Snapshot of every outbox entry, oldest first
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<OutboxEntry> = state.outbox.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Number of entries not yet sent
    pub fn pending_count(&self) -> usize {
        self.lock()
            .map(|s| {
                s.outbox
                    .values()
                    .filter(|e| e.status == OutboxStatus::Pending)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Make every call fail with `StoreError::Unavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.lock() {
            state.faults.unavailable = unavailable;
        }
    }

    /// Fail the next `count` calls to `mark_sent`, leaving the entries pending
    pub fn fail_next_mark_sent(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_mark_sent = count;
        }
    }

    /// Fail the next `count` calls to `update_status`
    pub fn fail_next_status_updates(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_status_updates = count;
        }
    }

    /// Let every outstanding lease run out now
    pub fn expire_leases(&self) {
        if let Ok(mut state) = self.lock() {
            let now = Utc::now();
            for entry in state.outbox.values_mut() {
                if entry.status == OutboxStatus::Pending {
                    entry.next_attempt_at = entry.next_attempt_at.map(|at| at.min(now));
                }
            }
        }
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn insert_with_outbox(
        &self,
        transaction: &Transaction,
        idempotency_key: Option<&str>,
        entry: &NewOutboxEntry,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.check_available()?;

        if let Some(key) = idempotency_key {
            if state.idempotency_keys.contains_key(key) {
                return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
            }
        }

        let id = Uuid::new_v4();
        state.outbox.insert(
            id,
            OutboxEntry {
                id,
                aggregate_id: entry.aggregate_id,
                event_type: entry.event_type.clone(),
                payload: entry.payload.clone(),
                status: OutboxStatus::Pending,
                created_at: Utc::now(),
                next_attempt_at: None,
                sent_at: None,
                attempts: 0,
                last_error: None,
                claim_token: None,
            },
        );
        if let Some(key) = idempotency_key {
            state
                .idempotency_keys
                .insert(key.to_string(), transaction.external_id());
        }
        state
            .transactions
            .insert(transaction.external_id(), transaction.clone());

        Ok(())
    }

    async fn find_by_id(&self, external_id: Uuid) -> Result<Option<Transaction>, StoreError> {
        let state = self.lock()?;
        state.check_available()?;
        Ok(state.transactions.get(&external_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let state = self.lock()?;
        state.check_available()?;
        Ok(state
            .idempotency_keys
            .get(key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn update_status(
        &self,
        external_id: Uuid,
        status: TransactionStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let mut state = self.lock()?;
        state.check_available()?;

        if state.faults.failing_status_updates > 0 {
            state.faults.failing_status_updates -= 1;
            return Err(StoreError::Unavailable("injected status write failure".to_string()));
        }

        let Some(tx) = state.transactions.get_mut(&external_id) else {
            return Ok(StatusUpdate::NotFound);
        };

        let current = tx.status();
        match tx.apply_status(status, Utc::now()) {
            Ok(StatusChange::Applied) => Ok(StatusUpdate::Applied),
            Ok(StatusChange::Unchanged) => Ok(StatusUpdate::Unchanged),
            Err(_) if current.is_final() => Ok(StatusUpdate::Conflict { current }),
            Err(e) => Err(StoreError::InvalidData(e.to_string())),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn dequeue_pending(
        &self,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut state = self.lock()?;
        state.check_available()?;

        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::InvalidData(format!("lease: {}", e)))?;

        let mut due: Vec<OutboxEntry> = state
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .filter(|e| e.next_attempt_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(claim_order);
        due.truncate(limit.max(0) as usize);

        let leased_until = now + lease;
        let token = Uuid::new_v4();
        for entry in &mut due {
            entry.claim_token = Some(token);
            if let Some(stored) = state.outbox.get_mut(&entry.id) {
                stored.next_attempt_at = Some(leased_until);
                stored.claim_token = Some(token);
            }
        }

        Ok(due)
    }

    async fn renew_claim(
        &self,
        id: Uuid,
        claim_token: Uuid,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        state.check_available()?;

        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::InvalidData(format!("lease: {}", e)))?;

        match state.outbox.get_mut(&id) {
            Some(entry)
                if entry.status == OutboxStatus::Pending
                    && entry.claim_token == Some(claim_token) =>
            {
                entry.next_attempt_at = Some(Utc::now() + lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        state.check_available()?;

        if state.faults.failing_mark_sent > 0 {
            state.faults.failing_mark_sent -= 1;
            return Err(StoreError::Unavailable("injected mark_sent failure".to_string()));
        }

        match state.outbox.get_mut(&id) {
            Some(entry) if entry.status == OutboxStatus::Pending => {
                entry.status = OutboxStatus::Sent;
                entry.sent_at = Some(Utc::now());
                entry.next_attempt_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.check_available()?;

        if let Some(entry) = state.outbox.get_mut(&id) {
            if entry.status == OutboxStatus::Pending {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
                entry.next_attempt_at = Some(retry_at);
                entry.claim_token = None;
            }
        }

        Ok(())
    }
}
