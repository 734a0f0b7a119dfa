//! Daily Totals
//!
//! Running approved spend per (source account, UTC day). The only write is
//! `accumulate_within`, which adds an amount only if the new total stays
//! within the cap. Check and add happen as one atomic step per key, so two
//! concurrent evaluations for the same account can never both pass.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::RiskError;

/// Daily total key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DailyKey {
    pub account_id: Uuid,
    pub day: NaiveDate,
}

impl DailyKey {
    pub fn new(account_id: Uuid, day: NaiveDate) -> Self {
        Self { account_id, day }
    }
}

/// Result of an accumulate attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulation {
    /// Amount added; `total` includes it
    Accepted { total: Decimal },
    /// Amount would breach the cap; `total` is the untouched current value
    Exceeded { total: Decimal },
}

/// Per-account, per-day running sums
#[async_trait]
pub trait DailyTotalsStore: Send + Sync {
    /// Current total, zero for an untouched key
    async fn total(&self, key: &DailyKey) -> Result<Decimal, RiskError>;

    /// Atomically add `amount` if `total + amount <= cap`
    async fn accumulate_within(
        &self,
        key: &DailyKey,
        amount: Decimal,
        cap: Decimal,
    ) -> Result<Accumulation, RiskError>;
}

// =========================================================================
// In-memory
// =========================================================================

/// Daily totals in process memory, one lock over all keys
#[derive(Debug, Clone, Default)]
pub struct InMemoryDailyTotals {
    totals: Arc<Mutex<HashMap<DailyKey, Decimal>>>,
}

impl InMemoryDailyTotals {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DailyTotalsStore for InMemoryDailyTotals {
    async fn total(&self, key: &DailyKey) -> Result<Decimal, RiskError> {
        let totals = self
            .totals
            .lock()
            .map_err(|_| RiskError::Unavailable("daily totals lock poisoned".to_string()))?;
        Ok(totals.get(key).copied().unwrap_or(Decimal::ZERO))
    }

    async fn accumulate_within(
        &self,
        key: &DailyKey,
        amount: Decimal,
        cap: Decimal,
    ) -> Result<Accumulation, RiskError> {
        let mut totals = self
            .totals
            .lock()
            .map_err(|_| RiskError::Unavailable("daily totals lock poisoned".to_string()))?;

        let current = totals.get(key).copied().unwrap_or(Decimal::ZERO);
        let next = current + amount;
        if next > cap {
            return Ok(Accumulation::Exceeded { total: current });
        }

        totals.insert(*key, next);
        Ok(Accumulation::Accepted { total: next })
    }
}

// =========================================================================
// PostgreSQL
// =========================================================================

/// Daily totals in the `daily_totals` table
#[derive(Debug, Clone)]
pub struct PgDailyTotals {
    pool: PgPool,
}

impl PgDailyTotals {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DailyTotalsStore for PgDailyTotals {
    async fn total(&self, key: &DailyKey) -> Result<Decimal, RiskError> {
        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT total FROM daily_totals WHERE account_id = $1 AND day = $2",
        )
        .bind(key.account_id)
        .bind(key.day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(total.unwrap_or(Decimal::ZERO))
    }

    async fn accumulate_within(
        &self,
        key: &DailyKey,
        amount: Decimal,
        cap: Decimal,
    ) -> Result<Accumulation, RiskError> {
        // The conflict branch only fires when the guarded sum fits; the row
        // lock taken by ON CONFLICT serializes concurrent writers per key.
        let accepted: Option<Decimal> = sqlx::query_scalar(
            r#"
            INSERT INTO daily_totals (account_id, day, total, updated_at)
            SELECT $1, $2, $3, NOW()
            WHERE $3 <= $4
            ON CONFLICT (account_id, day) DO UPDATE
            SET total = daily_totals.total + EXCLUDED.total,
                updated_at = NOW()
            WHERE daily_totals.total + EXCLUDED.total <= $4
            RETURNING total
            "#,
        )
        .bind(key.account_id)
        .bind(key.day)
        .bind(amount)
        .bind(cap)
        .fetch_optional(&self.pool)
        .await?;

        match accepted {
            Some(total) => Ok(Accumulation::Accepted { total }),
            None => Ok(Accumulation::Exceeded {
                total: self.total(key).await?,
            }),
        }
    }
}
