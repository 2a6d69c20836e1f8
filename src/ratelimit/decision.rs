//! Subscription quota decision point.
//!
//! Per request: burst check, identity check, usage read, limit comparison,
//! then (after the handler ran) conditional accounting. Only this module
//! chooses rejection responses; the ledger and burst guard report typed
//! outcomes.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::billing::{
    EffectivePeriod, LedgerError, PeriodCalculator, PlanLimit, PlanLimitRegistry, Subscription,
    UsageLedger, UsageStats,
};
use crate::cache::CacheOutcome;
use crate::error::{AppError, AppResult};

use super::burst::BurstGuard;

/// Identity attached by the upstream authentication stage.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub user_id: Uuid,
    pub subscription: Option<Subscription>,
}

/// Everything the decision point knows about the caller, passed explicitly.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<IpAddr>,
    pub identity: Option<ResolvedIdentity>,
}

impl RequestContext {
    pub fn identified(identity: ResolvedIdentity) -> Self {
        Self {
            client_ip: None,
            identity: Some(identity),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Deadline for each ledger call. Exceeding it is treated as an outage.
    pub ledger_timeout: Duration,
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            ledger_timeout: Duration::from_secs(2),
            trust_forwarded_for: false,
        }
    }
}

/// A request that passed the quota check and may be handled.
#[derive(Debug, Clone)]
pub struct Admission {
    pub user_id: Uuid,
    pub limit: PlanLimit,
    pub usage: i64,
    pub period: EffectivePeriod,
}

impl Admission {
    pub fn stats(&self) -> UsageStats {
        UsageStats::new(self.usage, self.limit, self.period.start, self.period.end)
    }
}

/// How a handled request was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    Counted,
    CacheSkipped,
    /// Increment failed after the response was produced; the request went uncounted.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub accounting: Accounting,
    pub stats: UsageStats,
}

// key: quota-decision-point -> admit, serve, then account
#[derive(Clone)]
pub struct DecisionPoint {
    ledger: Arc<dyn UsageLedger>,
    plans: Arc<PlanLimitRegistry>,
    periods: PeriodCalculator,
    burst: BurstGuard,
    settings: RateLimitSettings,
}

impl DecisionPoint {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        plans: PlanLimitRegistry,
        periods: PeriodCalculator,
        burst: BurstGuard,
        settings: RateLimitSettings,
    ) -> Self {
        Self {
            ledger,
            plans: Arc::new(plans),
            periods,
            burst,
            settings,
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn burst_guard(&self) -> &BurstGuard {
        &self.burst
    }

    /// First gate, ahead of identity resolution.
    pub fn check_burst(&self, ip: IpAddr) -> AppResult<()> {
        if self.burst.is_limited(ip) {
            debug!(%ip, state = "rejected_burst", "burst ceiling reached");
            return Err(AppError::BurstLimited);
        }
        Ok(())
    }

    /// Identity check, usage read and limit comparison.
    pub async fn admit(&self, context: &RequestContext, now: DateTime<Utc>) -> AppResult<Admission> {
        let Some(identity) = context.identity.as_ref() else {
            debug!(
                client_ip = ?context.client_ip,
                state = "rejected_auth",
                "request reached quota stage without identity"
            );
            return Err(AppError::Unauthorized);
        };
        let Some(subscription) = identity.subscription.as_ref() else {
            warn!(
                user_id = %identity.user_id,
                state = "rejected_auth",
                "authenticated request carries no subscription"
            );
            return Err(AppError::SubscriptionMissing);
        };

        let admission = self.read_usage(identity.user_id, subscription, now).await?;
        if admission.limit.is_exhausted_by(admission.usage) {
            debug!(
                user_id = %identity.user_id,
                usage = admission.usage,
                limit = admission.limit.as_raw(),
                state = "rejected_quota",
                "quota exhausted for period"
            );
            return Err(AppError::QuotaExceeded(admission.stats()));
        }

        debug!(
            user_id = %identity.user_id,
            usage = admission.usage,
            state = "allowed",
            "request admitted"
        );
        Ok(admission)
    }

    /// Usage in the subscription's effective period, without counting anything.
    pub async fn usage_stats(
        &self,
        user_id: Uuid,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> AppResult<UsageStats> {
        Ok(self.read_usage(user_id, subscription, now).await?.stats())
    }

    async fn read_usage(
        &self,
        user_id: Uuid,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> AppResult<Admission> {
        let (stored_start, stored_end) = subscription.period_bounds(self.periods.interval());
        let period = self.periods.current_period(stored_start, stored_end, now);
        let usage = self
            .bounded(self.ledger.get_current_usage(user_id, period.start, period.end))
            .await?
            .map(|record| record.request_count)
            .unwrap_or(0);
        let limit = self.plans.limit_for(&subscription.plan_type);

        Ok(Admission {
            user_id,
            limit,
            usage,
            period,
        })
    }

    /// Post-handler hook. Counts the request unless the response was a cache
    /// hit. Never fails: the response has already been produced.
    pub async fn settle(
        &self,
        admission: &Admission,
        outcome: CacheOutcome,
        now: DateTime<Utc>,
    ) -> Settlement {
        if outcome.is_hit() {
            debug!(user_id = %admission.user_id, state = "cache_skipped", "cache hit not counted");
            return Settlement {
                accounting: Accounting::CacheSkipped,
                stats: admission.stats(),
            };
        }

        match self
            .bounded(self.ledger.increment_usage(admission.user_id, now))
            .await
        {
            Ok(record) => {
                debug!(
                    user_id = %admission.user_id,
                    count = record.request_count,
                    state = "counted",
                    "request counted"
                );
                Settlement {
                    accounting: Accounting::Counted,
                    stats: UsageStats::new(
                        record.request_count,
                        admission.limit,
                        record.period_start,
                        record.period_end,
                    ),
                }
            }
            Err(err) => {
                error!(
                    user_id = %admission.user_id,
                    %err,
                    "usage increment failed after response was served; request uncounted"
                );
                Settlement {
                    accounting: Accounting::Failed,
                    stats: UsageStats::new(
                        admission.usage + 1,
                        admission.limit,
                        admission.period.start,
                        admission.period.end,
                    ),
                }
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> AppResult<T>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.settings.ledger_timeout, call).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::Unavailable(format!(
                "usage ledger call exceeded {:?}",
                self.settings.ledger_timeout
            ))),
        }
    }
}
