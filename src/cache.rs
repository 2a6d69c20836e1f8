//! Read-through response cache and the cache-hit annotation contract.
//!
//! Handlers serving from the cache mark the response `X-Cache: HIT`. That
//! header is the only signal the quota stage uses to skip accounting; any other
//! value, or no header at all, is counted.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl CacheOutcome {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers.get(CACHE_STATUS).and_then(|value| value.to_str().ok()) {
            Some(value) if value.trim().eq_ignore_ascii_case("hit") => CacheOutcome::Hit,
            _ => CacheOutcome::Miss,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit)
    }

    pub fn header_value(&self) -> HeaderValue {
        match self {
            CacheOutcome::Hit => HeaderValue::from_static("HIT"),
            CacheOutcome::Miss => HeaderValue::from_static("MISS"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

// key: response-cache -> keyed JSON bodies
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
    async fn put(&self, key: &str, body: Value) -> Result<(), CacheError>;
}

pub struct MemoryResponseCache {
    ttl: Duration,
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drops every entry older than the TTL, read or not.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Periodically evicts expired entries so per-user keys do not accumulate.
pub fn spawn_eviction(cache: Arc<MemoryResponseCache>) -> tokio::task::JoinHandle<()> {
    let period = cache.ttl().max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            cache.evict_expired();
        }
    })
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let hit = self.entries.get(key).and_then(|entry| {
            let (body, stored_at) = entry.value();
            (stored_at.elapsed() < self.ttl).then(|| body.clone())
        });
        if hit.is_none() {
            self.entries
                .remove_if(key, |_, (_, stored_at)| stored_at.elapsed() >= self.ttl);
        }
        Ok(hit)
    }

    async fn put(&self, key: &str, body: Value) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), (body, Instant::now()));
        Ok(())
    }
}

/// Serves `key` from the cache, or loads, stores and serves it.
///
/// Cache failures fail open: a read error is a miss and a write error only
/// loses the entry.
pub async fn read_through<F, Fut, E>(
    cache: &dyn ResponseCache,
    key: &str,
    load: F,
) -> Result<Response, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, E>>,
{
    match cache.get(key).await {
        Ok(Some(body)) => return Ok(annotate(body, CacheOutcome::Hit)),
        Ok(None) => {}
        Err(err) => warn!(%err, key, "response cache read failed; treating as miss"),
    }

    let body = load().await?;
    if let Err(err) = cache.put(key, body.clone()).await {
        warn!(%err, key, "response cache write failed");
    }
    Ok(annotate(body, CacheOutcome::Miss))
}

fn annotate(body: Value, outcome: CacheOutcome) -> Response {
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(CACHE_STATUS, outcome.header_value());
    response
}
