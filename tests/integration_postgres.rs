//! Postgres adapter tests
//!
//! Need `DATABASE_URL`. Run with
//! `cargo test --test integration_postgres -- --ignored --test-threads=1`.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use uuid::Uuid;

use txflow::domain::{Amount, Transaction, TransactionCreated, TRANSACTION_CREATED_V1};
use txflow::risk::{Accumulation, DailyKey, DailyTotalsStore, PgDailyTotals};
use txflow::store::{
    NewOutboxEntry, OutboxStatus, OutboxStore, PgOutboxStore, PgTransactionStore, StatusUpdate,
    StoreError, TransactionStore,
};
use txflow::{db, TransactionStatus};

mod common;

fn new_transaction(value: rust_decimal::Decimal) -> (Transaction, NewOutboxEntry) {
    let tx = Transaction::create(
        Uuid::new_v4(),
        Uuid::new_v4(),
        1,
        Amount::new(value).unwrap(),
        Utc::now(),
    );
    let entry = NewOutboxEntry::new(
        tx.external_id(),
        TRANSACTION_CREATED_V1,
        &TransactionCreated::from(&tx),
    )
    .unwrap();
    (tx, entry)
}

#[tokio::test]
#[ignore]
async fn test_insert_with_outbox_and_drain() {
    let pool = common::setup_test_db().await;
    let transactions = PgTransactionStore::new(pool.clone());
    let outbox = PgOutboxStore::new(pool.clone());

    let (tx, entry) = new_transaction(dec!(125.75));
    assert_ok!(transactions.insert_with_outbox(&tx, Some("pg-key-1"), &entry).await);

    let stored = transactions.find_by_id(tx.external_id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), TransactionStatus::Pending);
    assert_eq!(stored.value().value(), dec!(125.75));
    assert_eq!(outbox.pending_count().await.unwrap(), 1);

    let claimed = outbox
        .dequeue_pending(10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].aggregate_id, tx.external_id());

    // Leased entries are hidden from a second claimer
    let again = outbox
        .dequeue_pending(10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(again.is_empty());

    assert!(outbox.mark_sent(claimed[0].id).await.unwrap());
    assert!(!outbox.mark_sent(claimed[0].id).await.unwrap());
    assert_eq!(outbox.pending_count().await.unwrap(), 0);

    let status: String = sqlx::query_scalar("SELECT status FROM outbox WHERE id = $1")
        .bind(claimed[0].id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, OutboxStatus::Sent.as_str());
}

#[tokio::test]
#[ignore]
async fn test_duplicate_idempotency_key_writes_nothing() {
    let pool = common::setup_test_db().await;
    let transactions = PgTransactionStore::new(pool.clone());
    let outbox = PgOutboxStore::new(pool.clone());

    let (first, entry) = new_transaction(dec!(10));
    assert_ok!(transactions.insert_with_outbox(&first, Some("pg-dup"), &entry).await);

    let (second, entry) = new_transaction(dec!(20));
    let err = transactions
        .insert_with_outbox(&second, Some("pg-dup"), &entry)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdempotencyKey(_)));

    assert!(transactions.find_by_id(second.external_id()).await.unwrap().is_none());
    assert_eq!(outbox.pending_count().await.unwrap(), 1);

    let replayed = transactions.find_by_idempotency_key("pg-dup").await.unwrap().unwrap();
    assert_eq!(replayed.external_id(), first.external_id());
}

#[tokio::test]
#[ignore]
async fn test_failed_entry_is_retried_later() {
    let pool = common::setup_test_db().await;
    let transactions = PgTransactionStore::new(pool.clone());
    let outbox = PgOutboxStore::new(pool.clone());

    let (tx, entry) = new_transaction(dec!(10));
    assert_ok!(transactions.insert_with_outbox(&tx, None, &entry).await);

    let claimed = outbox.dequeue_pending(1, Duration::from_secs(30)).await.unwrap();
    assert_ok!(outbox.mark_failed(claimed[0].id, "broker down", Utc::now()).await);

    let retried = outbox.dequeue_pending(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempts, 1);
    assert_eq!(retried[0].last_error.as_deref(), Some("broker down"));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_claimers_never_overlap() {
    let pool = common::setup_test_db().await;
    let transactions = PgTransactionStore::new(pool.clone());

    let mut ids = HashSet::new();
    for _ in 0..40 {
        let (tx, entry) = new_transaction(dec!(10));
        assert_ok!(transactions.insert_with_outbox(&tx, None, &entry).await);
        ids.insert(tx.external_id());
    }

    let first = PgOutboxStore::new(pool.clone());
    let second = PgOutboxStore::new(pool.clone());
    let lease = Duration::from_secs(30);
    let (a, b) = tokio::join!(
        first.dequeue_pending(25, lease),
        second.dequeue_pending(25, lease)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let a_ids: HashSet<Uuid> = a.iter().map(|e| e.aggregate_id).collect();
    let b_ids: HashSet<Uuid> = b.iter().map(|e| e.aggregate_id).collect();
    assert!(a_ids.is_disjoint(&b_ids));

    // Whatever neither claimer reached is still claimable, exactly once
    let rest = first.dequeue_pending(40, lease).await.unwrap();
    let rest_ids: HashSet<Uuid> = rest.iter().map(|e| e.aggregate_id).collect();
    assert!(rest_ids.is_disjoint(&a_ids) && rest_ids.is_disjoint(&b_ids));
    assert_eq!(a.len() + b.len() + rest.len(), 40);
    assert_eq!(&(&a_ids | &b_ids) | &rest_ids, ids);
    assert!(first.dequeue_pending(40, lease).await.unwrap().is_empty());

    // One token per claim
    assert!(a.iter().all(|e| e.claim_token == a[0].claim_token));
    if let Some(other) = b.first() {
        assert!(b.iter().all(|e| e.claim_token == other.claim_token));
        assert_ne!(a[0].claim_token, other.claim_token);
    }
}

#[tokio::test]
#[ignore]
async fn test_claim_order_and_renewal_after_takeover() {
    let pool = common::setup_test_db().await;
    let transactions = PgTransactionStore::new(pool.clone());
    let outbox = PgOutboxStore::new(pool.clone());

    let (older, entry) = new_transaction(dec!(10));
    assert_ok!(transactions.insert_with_outbox(&older, None, &entry).await);
    let (newer, entry) = new_transaction(dec!(20));
    assert_ok!(transactions.insert_with_outbox(&newer, None, &entry).await);
    sqlx::query("UPDATE outbox SET created_at = NOW() - INTERVAL '1 minute' WHERE aggregate_id = $1")
        .bind(older.external_id())
        .execute(&pool)
        .await
        .unwrap();

    let lease = Duration::from_secs(30);
    let claimed = outbox.dequeue_pending(10, lease).await.unwrap();
    let order: Vec<Uuid> = claimed.iter().map(|e| e.aggregate_id).collect();
    assert_eq!(order, vec![older.external_id(), newer.external_id()]);

    let stale_token = claimed[0].claim_token.unwrap();
    assert!(outbox.renew_claim(claimed[0].id, stale_token, lease).await.unwrap());

    // Lease runs out and another claimer takes the rows over
    sqlx::query("UPDATE outbox SET next_attempt_at = NOW() - INTERVAL '1 second'")
        .execute(&pool)
        .await
        .unwrap();
    let taken = outbox.dequeue_pending(10, lease).await.unwrap();
    assert_eq!(taken.len(), 2);

    assert!(!outbox.renew_claim(claimed[0].id, stale_token, lease).await.unwrap());
    let token = taken[0].claim_token.unwrap();
    assert!(outbox.renew_claim(taken[0].id, token, lease).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_risk_pool_requires_daily_totals_table() {
    common::setup_test_db().await;
    let url = std::env::var("DATABASE_URL").unwrap();

    let pool = assert_ok!(db::connect_with_schema(&url, 2, db::RISK_TABLES).await);
    pool.close().await;

    let err = db::connect_with_schema(&url, 2, &["risk_rules"]).await.unwrap_err();
    assert!(matches!(err, db::SchemaError::Incomplete(["risk_rules"])));
}

#[tokio::test]
#[ignore]
async fn test_update_status_outcomes() {
    let pool = common::setup_test_db().await;
    let transactions = PgTransactionStore::new(pool);

    let (tx, entry) = new_transaction(dec!(10));
    assert_ok!(transactions.insert_with_outbox(&tx, None, &entry).await);
    let id = tx.external_id();

    assert_eq!(
        transactions.update_status(id, TransactionStatus::Approved).await.unwrap(),
        StatusUpdate::Applied
    );
    assert_eq!(
        transactions.update_status(id, TransactionStatus::Approved).await.unwrap(),
        StatusUpdate::Unchanged
    );
    assert_eq!(
        transactions.update_status(id, TransactionStatus::Rejected).await.unwrap(),
        StatusUpdate::Conflict {
            current: TransactionStatus::Approved
        }
    );
    assert_eq!(
        transactions
            .update_status(Uuid::new_v4(), TransactionStatus::Rejected)
            .await
            .unwrap(),
        StatusUpdate::NotFound
    );
}

#[tokio::test]
#[ignore]
async fn test_daily_totals_cap_under_concurrency() {
    let pool = common::setup_test_db().await;
    let totals = Arc::new(PgDailyTotals::new(pool));
    let key = DailyKey::new(Uuid::new_v4(), Utc::now().date_naive());

    let mut tasks = Vec::new();
    for _ in 0..15 {
        let totals = totals.clone();
        tasks.push(tokio::spawn(async move {
            totals.accumulate_within(&key, dec!(2000), dec!(20500)).await
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        if let Accumulation::Accepted { .. } = task.await.unwrap().unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 10);
    assert_eq!(totals.total(&key).await.unwrap(), dec!(20000));
}
