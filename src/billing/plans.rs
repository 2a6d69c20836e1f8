//! Plan tier to per-period request ceiling mapping.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [PlanTier::Free, PlanTier::Pro, PlanTier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "FREE",
            PlanTier::Pro => "PRO",
            PlanTier::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown subscription plan `{0}`")]
pub struct UnknownPlan(pub String);

impl FromStr for PlanTier {
    type Err = UnknownPlan;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(PlanTier::Free),
            "PRO" => Ok(PlanTier::Pro),
            "ENTERPRISE" => Ok(PlanTier::Enterprise),
            _ => Err(UnknownPlan(raw.to_string())),
        }
    }
}

/// Request ceiling for one billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanLimit {
    Limited(u64),
    Unlimited,
}

impl PlanLimit {
    /// Negative values are the unlimited sentinel.
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            PlanLimit::Unlimited
        } else {
            PlanLimit::Limited(raw as u64)
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            PlanLimit::Limited(limit) => i64::try_from(*limit).unwrap_or(i64::MAX),
            PlanLimit::Unlimited => -1,
        }
    }

    pub fn is_exhausted_by(&self, used: i64) -> bool {
        match self {
            PlanLimit::Limited(_) => used >= self.as_raw(),
            PlanLimit::Unlimited => false,
        }
    }

    pub fn remaining(&self, used: i64) -> Option<i64> {
        match self {
            PlanLimit::Limited(_) => Some(self.as_raw().saturating_sub(used).max(0)),
            PlanLimit::Unlimited => None,
        }
    }

    fn is_stricter_than(&self, other: &PlanLimit) -> bool {
        match (self, other) {
            (PlanLimit::Limited(a), PlanLimit::Limited(b)) => a < b,
            (PlanLimit::Limited(_), PlanLimit::Unlimited) => true,
            (PlanLimit::Unlimited, _) => false,
        }
    }
}

// key: plan-limit-registry -> static tier ceilings
#[derive(Debug, Clone)]
pub struct PlanLimitRegistry {
    limits: HashMap<PlanTier, PlanLimit>,
}

impl PlanLimitRegistry {
    pub fn new(free: i64, pro: i64, enterprise: i64) -> Self {
        let limits = HashMap::from([
            (PlanTier::Free, PlanLimit::from_raw(free)),
            (PlanTier::Pro, PlanLimit::from_raw(pro)),
            (PlanTier::Enterprise, PlanLimit::from_raw(enterprise)),
        ]);
        Self { limits }
    }

    pub fn limit_for_tier(&self, tier: PlanTier) -> PlanLimit {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| self.most_restrictive().1)
    }

    /// Resolves the ceiling for a stored plan string. Unknown plans are a
    /// configuration error and fall back to the most restrictive tier.
    pub fn limit_for(&self, plan: &str) -> PlanLimit {
        self.limit_for_tier(self.tier_for(plan))
    }

    pub fn tier_for(&self, plan: &str) -> PlanTier {
        match plan.parse::<PlanTier>() {
            Ok(tier) => tier,
            Err(err) => {
                let (fallback, _) = self.most_restrictive();
                warn!(%err, fallback = %fallback, "subscription references an unknown plan");
                fallback
            }
        }
    }

    pub fn most_restrictive(&self) -> (PlanTier, PlanLimit) {
        PlanTier::ALL
            .iter()
            .map(|tier| {
                let limit = self
                    .limits
                    .get(tier)
                    .copied()
                    .unwrap_or(PlanLimit::Limited(0));
                (*tier, limit)
            })
            .reduce(|current, candidate| {
                if candidate.1.is_stricter_than(&current.1) {
                    candidate
                } else {
                    current
                }
            })
            .unwrap_or((PlanTier::Free, PlanLimit::Limited(0)))
    }
}

impl Default for PlanLimitRegistry {
    fn default() -> Self {
        Self::new(1000, 300_000, -1)
    }
}
