use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::billing::UsageStats;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Writes the quota headers, replacing any previous values.
pub fn apply_usage_headers(headers: &mut HeaderMap, stats: &UsageStats) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(stats.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(stats.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(stats.reset_epoch()));
}
