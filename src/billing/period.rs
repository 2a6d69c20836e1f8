//! Billing period roll-forward.
//!
//! A subscription stores the window it was last accounted against. Once that
//! window has elapsed the effective window is derived by stepping whole
//! intervals forward from the stored end until it covers "now".

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use tracing::warn;

/// Length of one billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingInterval {
    #[default]
    Monthly,
    Weekly,
    Daily,
}

impl BillingInterval {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Some(BillingInterval::Monthly),
            "weekly" | "week" => Some(BillingInterval::Weekly),
            "daily" | "day" => Some(BillingInterval::Daily),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Weekly => "weekly",
            BillingInterval::Daily => "daily",
        }
    }

    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.advance_by(from, 1)
    }

    fn advance_by(&self, from: DateTime<Utc>, periods: u32) -> Option<DateTime<Utc>> {
        match self {
            BillingInterval::Monthly => from.checked_add_months(Months::new(periods)),
            BillingInterval::Weekly => {
                from.checked_add_signed(Duration::days(7 * i64::from(periods)))
            }
            BillingInterval::Daily => from.checked_add_signed(Duration::days(i64::from(periods))),
        }
    }

    /// Lower-bound estimate of whole periods between `from` and `to`.
    fn periods_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        match self {
            BillingInterval::Monthly => {
                i64::from(to.year() - from.year()) * 12 + i64::from(to.month())
                    - i64::from(from.month())
                    - 1
            }
            BillingInterval::Weekly => (to - from).num_weeks(),
            BillingInterval::Daily => (to - from).num_days(),
        }
    }
}

/// The accounting window that is current for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// `true` when the window differs from the stored one and must be persisted.
    pub changed: bool,
}

// key: billing-period-calculator -> rolling windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodCalculator {
    interval: BillingInterval,
    max_rolls: u32,
}

impl Default for PeriodCalculator {
    fn default() -> Self {
        Self::new(BillingInterval::Monthly, 120)
    }
}

impl PeriodCalculator {
    pub fn new(interval: BillingInterval, max_rolls: u32) -> Self {
        Self {
            interval,
            max_rolls: max_rolls.max(1),
        }
    }

    pub fn interval(&self) -> BillingInterval {
        self.interval
    }

    pub fn current_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EffectivePeriod {
        if now <= end {
            return EffectivePeriod {
                start,
                end,
                changed: false,
            };
        }

        // Every boundary is `end + k` intervals, so month-end anchors do not
        // drift and the capped path below lands on the same window.
        let mut period_start = end;
        for k in 1..=self.max_rolls {
            let Some(period_end) = self.interval.advance_by(end, k) else {
                return self.fail_safe(now);
            };
            if period_end > now {
                return EffectivePeriod {
                    start: period_start,
                    end: period_end,
                    changed: true,
                };
            }
            period_start = period_end;
        }

        warn!(
            stored_end = %end,
            %now,
            max_rolls = self.max_rolls,
            "subscription period is pathologically stale; computing window directly"
        );
        self.skip_to(end, now)
    }

    /// Jumps straight to the first window after `anchor` whose end exceeds `now`.
    fn skip_to(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> EffectivePeriod {
        let estimate = self.interval.periods_between(anchor, now).max(1);
        let Ok(mut periods) = u32::try_from(estimate) else {
            return self.fail_safe(now);
        };

        loop {
            match self.interval.advance_by(anchor, periods) {
                Some(end) if end > now => break,
                Some(_) => periods += 1,
                None => return self.fail_safe(now),
            }
        }
        while periods > 1 {
            match self.interval.advance_by(anchor, periods - 1) {
                Some(end) if end > now => periods -= 1,
                _ => break,
            }
        }

        match (
            self.interval.advance_by(anchor, periods - 1),
            self.interval.advance_by(anchor, periods),
        ) {
            (Some(start), Some(end)) => EffectivePeriod {
                start,
                end,
                changed: true,
            },
            _ => self.fail_safe(now),
        }
    }

    fn fail_safe(&self, now: DateTime<Utc>) -> EffectivePeriod {
        warn!(%now, "billing period arithmetic overflowed; anchoring window at now");
        EffectivePeriod {
            start: now,
            end: self
                .interval
                .advance(now)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            changed: true,
        }
    }
}
