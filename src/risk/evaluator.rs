//! Rule Evaluator
//!
//! Approve/reject decision for one transaction:
//!
//! 1. amount above the per-transaction limit: reject `amount_limit`,
//!    daily total untouched
//! 2. amount that would push the day's total above the cap: reject
//!    `daily_cap`, daily total untouched
//! 3. otherwise the amount is added to the day's total and approved `ok`
//!
//! The day is the UTC calendar date of the event timestamp, or of the
//! clock when the event carries none.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::VerdictStatus;

use super::{Accumulation, DailyKey, DailyTotalsStore, RiskError};

/// Spending limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulesConfig {
    pub per_transaction_limit: Decimal,
    pub daily_cap: Decimal,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            per_transaction_limit: Decimal::new(2500, 0),
            daily_cap: Decimal::new(20500, 0),
        }
    }
}

/// Time source for events without a timestamp
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Reason code carried on the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Ok,
    AmountLimit,
    DailyCap,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Ok => "ok",
            DecisionReason::AmountLimit => "amount_limit",
            DecisionReason::DailyCap => "daily_cap",
        }
    }
}

/// Evaluation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub status: VerdictStatus,
    pub reason: DecisionReason,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    fn approve(at: DateTime<Utc>) -> Self {
        Self {
            status: VerdictStatus::Approved,
            reason: DecisionReason::Ok,
            evaluated_at: at,
        }
    }

    fn reject(reason: DecisionReason, at: DateTime<Utc>) -> Self {
        Self {
            status: VerdictStatus::Rejected,
            reason,
            evaluated_at: at,
        }
    }
}

/// Spending-limit rules over per-account daily totals
#[derive(Clone)]
pub struct RuleEvaluator {
    totals: Arc<dyn DailyTotalsStore>,
    rules: RulesConfig,
    clock: Arc<dyn Clock>,
}

impl RuleEvaluator {
    pub fn new(totals: Arc<dyn DailyTotalsStore>, rules: RulesConfig) -> Self {
        Self::with_clock(totals, rules, Arc::new(SystemClock))
    }

    pub fn with_clock(
        totals: Arc<dyn DailyTotalsStore>,
        rules: RulesConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            totals,
            rules,
            clock,
        }
    }

    pub fn rules(&self) -> &RulesConfig {
        &self.rules
    }

    /// Decide on one transaction from `account_id`.
    ///
    /// Approval adds `amount` to the account's total for the day; rejections
    /// leave it untouched.
    pub async fn evaluate(
        &self,
        account_id: Uuid,
        amount: Decimal,
        occurred_at: Option<DateTime<Utc>>,
    ) -> Result<Decision, RiskError> {
        if amount <= Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        let evaluated_at = self.clock.now();

        if amount > self.rules.per_transaction_limit {
            return Ok(Decision::reject(DecisionReason::AmountLimit, evaluated_at));
        }

        let day = occurred_at.unwrap_or(evaluated_at).date_naive();
        let key = DailyKey::new(account_id, day);

        match self
            .totals
            .accumulate_within(&key, amount, self.rules.daily_cap)
            .await?
        {
            Accumulation::Accepted { total } => {
                tracing::debug!(
                    account_id = %account_id,
                    day = %day,
                    total = %total,
                    "Daily total increased"
                );
                Ok(Decision::approve(evaluated_at))
            }
            Accumulation::Exceeded { total } => {
                tracing::debug!(
                    account_id = %account_id,
                    day = %day,
                    total = %total,
                    amount = %amount,
                    "Daily cap would be exceeded"
                );
                Ok(Decision::reject(DecisionReason::DailyCap, evaluated_at))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::InMemoryDailyTotals;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 6, 12, 0, 0).unwrap()
    }

    fn evaluator() -> (RuleEvaluator, InMemoryDailyTotals) {
        let totals = InMemoryDailyTotals::new();
        let evaluator = RuleEvaluator::with_clock(
            Arc::new(totals.clone()),
            RulesConfig::default(),
            Arc::new(FixedClock(noon())),
        );
        (evaluator, totals)
    }

    #[tokio::test]
    async fn test_ten_approvals_then_daily_cap_then_headroom() {
        let (evaluator, _) = evaluator();
        let account = Uuid::new_v4();

        for _ in 0..10 {
            let decision = evaluator.evaluate(account, dec!(2000), Some(noon())).await.unwrap();
            assert_eq!(decision.status, VerdictStatus::Approved);
            assert_eq!(decision.reason, DecisionReason::Ok);
        }

        let over = evaluator.evaluate(account, dec!(600), Some(noon())).await.unwrap();
        assert_eq!(over.status, VerdictStatus::Rejected);
        assert_eq!(over.reason, DecisionReason::DailyCap);

        let fits = evaluator.evaluate(account, dec!(400), Some(noon())).await.unwrap();
        assert_eq!(fits.status, VerdictStatus::Approved);
    }

    #[tokio::test]
    async fn test_amount_limit_does_not_touch_total() {
        let (evaluator, totals) = evaluator();
        let account = Uuid::new_v4();

        let decision = evaluator.evaluate(account, dec!(2600), Some(noon())).await.unwrap();

        assert_eq!(decision.status, VerdictStatus::Rejected);
        assert_eq!(decision.reason, DecisionReason::AmountLimit);
        let key = DailyKey::new(account, noon().date_naive());
        assert_eq!(totals.total(&key).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_limit_is_inclusive() {
        let (evaluator, _) = evaluator();

        let decision = evaluator
            .evaluate(Uuid::new_v4(), dec!(2500), Some(noon()))
            .await
            .unwrap();

        assert_eq!(decision.status, VerdictStatus::Approved);
    }

    #[tokio::test]
    async fn test_day_buckets_follow_event_timestamp() {
        let (evaluator, totals) = evaluator();
        let account = Uuid::new_v4();
        let yesterday = noon() - chrono::Duration::days(1);

        evaluator.evaluate(account, dec!(100), Some(yesterday)).await.unwrap();
        evaluator.evaluate(account, dec!(50), None).await.unwrap();

        let yesterday_key = DailyKey::new(account, yesterday.date_naive());
        let today_key = DailyKey::new(account, noon().date_naive());
        assert_eq!(totals.total(&yesterday_key).await.unwrap(), dec!(100));
        assert_eq!(totals.total(&today_key).await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_an_error() {
        let (evaluator, _) = evaluator();

        let result = evaluator.evaluate(Uuid::new_v4(), dec!(0), None).await;

        assert!(matches!(result, Err(RiskError::InvalidInput(_))));
    }
}
