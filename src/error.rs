use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::{LedgerError, UsageStats};
use crate::ratelimit::headers::apply_usage_headers;

pub const QUOTA_EXCEEDED_MESSAGE: &str =
    "Rate limit exceeded. Please upgrade your subscription for higher limits.";
pub const BURST_LIMITED_MESSAGE: &str =
    "Too many requests from this address. Please slow down and retry shortly.";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("subscription not found")]
    SubscriptionMissing,
    #[error("{}", QUOTA_EXCEEDED_MESSAGE)]
    QuotaExceeded(UsageStats),
    #[error("{}", BURST_LIMITED_MESSAGE)]
    BurstLimited,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        if err.is_transient() {
            AppError::Unavailable(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::SubscriptionMissing => StatusCode::FORBIDDEN,
            AppError::QuotaExceeded(_) | AppError::BurstLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Unavailable(_) | AppError::Internal(_) => tracing::error!(?self),
            _ => tracing::debug!(%status, "request rejected"),
        }
        let body = match &self {
            // Operators get the detail through logs; clients get the category.
            AppError::Unavailable(_) => "Service temporarily unavailable".to_string(),
            AppError::Internal(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        };
        let mut response = (status, body).into_response();
        if let AppError::QuotaExceeded(stats) = &self {
            apply_usage_headers(response.headers_mut(), stats);
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
