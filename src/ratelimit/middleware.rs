use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::debug;

use crate::cache::CacheOutcome;

use super::decision::{DecisionPoint, RequestContext, ResolvedIdentity};
use super::headers::apply_usage_headers;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Client address. `X-Forwarded-For` is honored only when the deployment sits
/// behind a trusted proxy.
pub fn client_ip<B>(req: &Request<B>, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

// key: ratelimit-middleware -> per-address burst gate
pub async fn enforce_burst_limit<B>(
    State(decision): State<DecisionPoint>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    if decision.burst_guard().is_enabled() {
        match client_ip(&req, decision.settings().trust_forwarded_for) {
            Some(ip) => {
                if let Err(rejection) = decision.check_burst(ip) {
                    return rejection.into_response();
                }
            }
            None => debug!(uri = %req.uri(), "client address unknown; burst check skipped"),
        }
    }
    next.run(req).await
}

// key: ratelimit-middleware -> subscription quota gate and accounting
/// Must sit inside identity resolution. Rejections short-circuit the handler;
/// admitted requests are counted after the handler unless it served a cache hit.
pub async fn enforce_quota<B>(
    State(decision): State<DecisionPoint>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let context = RequestContext {
        client_ip: client_ip(&req, decision.settings().trust_forwarded_for),
        identity: req.extensions().get::<ResolvedIdentity>().cloned(),
    };
    let admission = match decision.admit(&context, Utc::now()).await {
        Ok(admission) => admission,
        Err(rejection) => return rejection.into_response(),
    };

    let mut response = next.run(req).await;

    let outcome = CacheOutcome::from_headers(response.headers());
    let settlement = decision.settle(&admission, outcome, Utc::now()).await;
    apply_usage_headers(response.headers_mut(), &settlement.stats);
    response
}
