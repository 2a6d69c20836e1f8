pub mod api;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod period;
pub mod plans;

pub use api::current_usage as billing_current_usage;
pub use ledger::{LedgerError, PgUsageLedger, UsageLedger};
pub use memory::MemoryUsageLedger;
pub use models::{Subscription, UsageRecord, UsageStats};
pub use period::{BillingInterval, EffectivePeriod, PeriodCalculator};
pub use plans::{PlanLimit, PlanLimitRegistry, PlanTier};
