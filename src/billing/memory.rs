//! Process-local usage ledger for tests and database-less runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::ledger::{LedgerError, UsageLedger};
use super::models::{Subscription, UsageRecord};
use super::period::PeriodCalculator;

type PeriodKey = (Uuid, DateTime<Utc>, DateTime<Utc>);

#[derive(Default)]
struct LedgerState {
    subscriptions: HashMap<Uuid, Subscription>,
    usage: HashMap<PeriodKey, UsageRecord>,
}

// key: usage-ledger-memory -> mutex-guarded unit of work
/// The whole read-roll-increment sequence runs under one lock, which gives the
/// same serialization the Postgres row lock provides.
pub struct MemoryUsageLedger {
    periods: PeriodCalculator,
    state: Mutex<LedgerState>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryUsageLedger {
    pub fn new(periods: PeriodCalculator) -> Self {
        Self {
            periods,
            state: Mutex::new(LedgerState::default()),
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Stores the subscription, replacing any previous one for the same user.
    pub async fn upsert_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.user_id, subscription);
    }

    pub async fn subscription(&self, user_id: Uuid) -> Option<Subscription> {
        self.state.lock().await.subscriptions.get(&user_id).cloned()
    }

    /// Fault injection for tests and local runs: every operation fails as
    /// [`LedgerError::Unavailable`] while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fault injection for tests and local runs: delays every operation, which
    /// lets callers exercise their deadlines.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn guard(&self) -> Result<(), LedgerError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("memory ledger offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, LedgerError> {
        self.guard().await?;
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .get(&user_id)
            .filter(|subscription| subscription.is_active())
            .cloned())
    }

    async fn get_current_usage(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>, LedgerError> {
        self.guard().await?;
        let state = self.state.lock().await;
        Ok(state
            .usage
            .get(&(user_id, period_start, period_end))
            .cloned())
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, LedgerError> {
        self.guard().await?;
        let mut state = self.state.lock().await;

        let subscription = state
            .subscriptions
            .get_mut(&user_id)
            .filter(|subscription| subscription.is_active())
            .ok_or(LedgerError::SubscriptionNotFound(user_id))?;

        let (stored_start, stored_end) = subscription.period_bounds(self.periods.interval());
        let period = self.periods.current_period(stored_start, stored_end, now);
        if period.changed || subscription.end_date.is_none() {
            subscription.start_date = period.start;
            subscription.end_date = Some(period.end);
            subscription.updated_at = now;
        }

        let record = state
            .usage
            .entry((user_id, period.start, period.end))
            .or_insert_with(|| UsageRecord {
                id: Uuid::new_v4(),
                user_id,
                period_start: period.start,
                period_end: period.end,
                request_count: 0,
                created_at: now,
                updated_at: now,
            });
        record.request_count += 1;
        record.updated_at = now;

        Ok(record.clone())
    }
}
