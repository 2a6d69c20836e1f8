//! Identity resolution stage.
//!
//! Decodes the caller's token and attaches a [`ResolvedIdentity`] carrying the
//! active subscription. Requests without a valid token pass through
//! unannotated; the quota stage turns that into a 401.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::billing::UsageLedger;
use crate::error::AppError;
use crate::ratelimit::ResolvedIdentity;

const AUTH_COOKIE: &str = "auth_token";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

// key: identity-resolution -> token to user and subscription
#[derive(Clone)]
pub struct IdentityResolver {
    ledger: Arc<dyn UsageLedger>,
    decoding_key: DecodingKey,
    lookup_timeout: Duration,
}

impl IdentityResolver {
    pub fn new(ledger: Arc<dyn UsageLedger>, secret: &str, lookup_timeout: Duration) -> Self {
        Self {
            ledger,
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            lookup_timeout,
        }
    }

    /// User id from a valid token, or `None`.
    pub fn user_id(&self, headers: &HeaderMap) -> Option<Uuid> {
        let token = bearer_token(headers).or_else(|| cookie_token(headers))?;
        let decoded = decode::<Claims>(&token, &self.decoding_key, &Validation::default())
            .map_err(|err| debug!(%err, "rejected token"))
            .ok()?;
        Uuid::parse_str(&decoded.claims.sub)
            .map_err(|err| debug!(%err, "token subject is not a user id"))
            .ok()
    }

    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Option<ResolvedIdentity>, AppError> {
        let Some(user_id) = self.user_id(headers) else {
            return Ok(None);
        };
        let subscription =
            match tokio::time::timeout(self.lookup_timeout, self.ledger.active_subscription(user_id))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AppError::Unavailable(format!(
                        "subscription lookup exceeded {:?}",
                        self.lookup_timeout
                    )))
                }
            };
        Ok(Some(ResolvedIdentity {
            user_id,
            subscription,
        }))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(AUTH_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|token| token.to_string())
        })
}

pub async fn resolve_identity<B>(
    State(resolver): State<IdentityResolver>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    match resolver.resolve(req.headers()).await {
        Ok(Some(identity)) => {
            req.extensions_mut().insert(identity);
        }
        Ok(None) => {}
        Err(err) => return err.into_response(),
    }
    next.run(req).await
}

/// Signs a token for `user_id` valid for `ttl`.
pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = (Utc::now() + ttl).timestamp().max(0) as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
