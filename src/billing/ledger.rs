use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::models::{Subscription, UsageRecord};
use super::period::PeriodCalculator;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no active subscription for user {0}")]
    SubscriptionNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("usage ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Infrastructure failures that may clear on their own, as opposed to
    /// missing configuration rows.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LedgerError::SubscriptionNotFound(_))
    }
}

// key: usage-ledger -> per-period request counters
/// Implementations own every mutation of usage records. `increment_usage`
/// resolves the effective period itself inside its unit of work; callers never
/// pass a period in.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn active_subscription(&self, user_id: Uuid)
        -> Result<Option<Subscription>, LedgerError>;

    /// `None` means nothing has been counted in that window yet.
    async fn get_current_usage(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>, LedgerError>;

    async fn increment_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, LedgerError>;
}

// key: usage-ledger-postgres -> transactional roll + increment
#[derive(Clone)]
pub struct PgUsageLedger {
    pool: PgPool,
    periods: PeriodCalculator,
}

impl PgUsageLedger {
    pub fn new(pool: PgPool, periods: PeriodCalculator) -> Self {
        Self { pool, periods }
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, LedgerError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, user_id, plan_type, start_date, end_date, status, created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    async fn get_current_usage(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>, LedgerError> {
        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT * FROM api_usage
            WHERE user_id = $1
              AND period_start = $2
              AND period_end = $3
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent roll-forwards and increments for this user.
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, user_id, plan_type, start_date, end_date, status, created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::SubscriptionNotFound(user_id))?;

        let (stored_start, stored_end) = subscription.period_bounds(self.periods.interval());
        let period = self.periods.current_period(stored_start, stored_end, now);

        if period.changed || subscription.end_date.is_none() {
            sqlx::query(
                "UPDATE subscriptions SET start_date = $2, end_date = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(subscription.id)
            .bind(period.start)
            .bind(period.end)
            .execute(&mut *tx)
            .await?;
            debug!(
                %user_id,
                period_start = %period.start,
                period_end = %period.end,
                "rolled subscription billing period forward"
            );
        }

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            INSERT INTO api_usage (
                id,
                user_id,
                period_start,
                period_end,
                request_count
            ) VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (user_id, period_start, period_end)
            DO UPDATE SET
                request_count = api_usage.request_count + 1,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(record)
    }
}
