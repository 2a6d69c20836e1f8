pub mod burst;
pub mod decision;
pub mod headers;
pub mod middleware;

pub use burst::{spawn_eviction, BurstGuard, BurstGuardConfig};
pub use decision::{
    Accounting, Admission, DecisionPoint, RateLimitSettings, RequestContext, ResolvedIdentity,
    Settlement,
};
pub use middleware::{client_ip, enforce_burst_limit, enforce_quota};
