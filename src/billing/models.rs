use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::period::BillingInterval;
use super::plans::PlanLimit;

// key: usage-models -> subscriptions,usage records
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_type: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }

    /// Stored accounting window. A missing `end_date` is read as one full
    /// interval after `start_date`.
    pub fn period_bounds(&self, interval: BillingInterval) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self
            .end_date
            .or_else(|| interval.advance(self.start_date))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (self.start_date, end)
    }
}

// key: usage-record-model -> one counter per (user, period_start, period_end)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub request_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Consumption snapshot surfaced to clients through headers and the usage report.
///
/// `limit` and `remaining` are `-1` for unlimited plans.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UsageStats {
    pub current_count: i64,
    pub limit: i64,
    pub remaining: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl UsageStats {
    pub fn new(
        current_count: i64,
        limit: PlanLimit,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            current_count,
            limit: limit.as_raw(),
            remaining: limit.remaining(current_count).unwrap_or(-1),
            period_start,
            period_end,
        }
    }

    pub fn reset_epoch(&self) -> i64 {
        self.period_end.timestamp()
    }
}
