use axum::{extract::State, Extension, Json};
use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::ratelimit::{DecisionPoint, ResolvedIdentity};

use super::UsageStats;

// key: billing-api -> usage report for the calling user
/// Read-only: the report itself is not metered.
pub async fn current_usage(
    State(decision): State<DecisionPoint>,
    identity: Option<Extension<ResolvedIdentity>>,
) -> AppResult<Json<UsageStats>> {
    let Extension(identity) = identity.ok_or(AppError::Unauthorized)?;
    let subscription = identity
        .subscription
        .as_ref()
        .ok_or(AppError::SubscriptionMissing)?;

    let stats = decision
        .usage_stats(identity.user_id, subscription, Utc::now())
        .await?;
    Ok(Json(stats))
}
