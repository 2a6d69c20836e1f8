use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use quota_gateway::{
    auth::{issue_token, IdentityResolver},
    billing::{MemoryUsageLedger, PeriodCalculator, PlanLimitRegistry, Subscription, UsageLedger},
    cache::MemoryResponseCache,
    error::QUOTA_EXCEEDED_MESSAGE,
    ratelimit::{BurstGuard, BurstGuardConfig, DecisionPoint, RateLimitSettings},
    router, AppState,
};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

const SECRET: &str = "quota-flow-secret";

struct Harness {
    app: Router,
    ledger: Arc<MemoryUsageLedger>,
}

struct Options {
    free_limit: i64,
    cache_ttl: Duration,
    burst: BurstGuardConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            free_limit: 3,
            cache_ttl: Duration::ZERO,
            burst: BurstGuardConfig {
                max_requests: 0,
                ..BurstGuardConfig::default()
            },
        }
    }
}

fn harness(options: Options) -> Harness {
    let periods = PeriodCalculator::default();
    let ledger = Arc::new(MemoryUsageLedger::new(periods));
    let settings = RateLimitSettings {
        ledger_timeout: Duration::from_millis(200),
        trust_forwarded_for: false,
    };
    let state = AppState {
        decision: DecisionPoint::new(
            ledger.clone(),
            PlanLimitRegistry::new(options.free_limit, 300_000, -1),
            periods,
            BurstGuard::new(options.burst),
            settings,
        ),
        identity: IdentityResolver::new(ledger.clone(), SECRET, settings.ledger_timeout),
        cache: Arc::new(MemoryResponseCache::new(options.cache_ttl)),
    };
    Harness {
        app: router(state),
        ledger,
    }
}

fn subscription(user_id: Uuid, plan: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        user_id,
        plan_type: plan.into(),
        start_date: start,
        end_date: Some(end),
        status: "active".into(),
        created_at: start,
        updated_at: start,
    }
}

async fn subscribed_user(harness: &Harness, plan: &str) -> (Uuid, String) {
    let user_id = Uuid::new_v4();
    let now = Utc::now();
    harness
        .ledger
        .upsert_subscription(subscription(
            user_id,
            plan,
            now - ChronoDuration::days(1),
            now + ChronoDuration::days(29),
        ))
        .await;
    (user_id, token(user_id))
}

fn token(user_id: Uuid) -> String {
    issue_token(SECRET, user_id, ChronoDuration::hours(1)).unwrap()
}

fn get(uri: &str, token: Option<&str>, peer: Option<SocketAddr>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    if let Some(peer) = peer {
        builder = builder.extension(ConnectInfo(peer));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn header_i64(response: &Response, name: &str) -> i64 {
    response.headers()[name].to_str().unwrap().parse().unwrap()
}

async fn json_body(response: Response) -> Value {
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn free_plan_admits_exactly_its_limit() {
    let harness = harness(Options::default());
    let (_, token) = subscribed_user(&harness, "FREE").await;

    for expected_remaining in [2, 1, 0] {
        let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "MISS");
        assert_eq!(header_i64(&response, "x-ratelimit-limit"), 3);
        assert_eq!(header_i64(&response, "x-ratelimit-remaining"), expected_remaining);
    }

    let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_i64(&response, "x-ratelimit-remaining"), 0);
    assert!(header_i64(&response, "x-ratelimit-reset") > Utc::now().timestamp());
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, QUOTA_EXCEEDED_MESSAGE.as_bytes());
}

#[tokio::test]
async fn cache_hits_are_served_without_consuming_quota() {
    let harness = harness(Options {
        cache_ttl: Duration::from_secs(60),
        ..Options::default()
    });
    let (_, token) = subscribed_user(&harness, "FREE").await;

    let first = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
    assert_eq!(first.headers()["x-cache"], "MISS");
    assert_eq!(header_i64(&first, "x-ratelimit-remaining"), 2);

    for _ in 0..1000 {
        let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(header_i64(&response, "x-ratelimit-remaining"), 2);
    }

    let usage = send(&harness.app, get("/api/v1/usage", Some(&token), None)).await;
    assert_eq!(json_body(usage).await["current_count"], 1);
}

#[tokio::test]
async fn unlimited_plan_reports_negative_one() {
    let harness = harness(Options::default());
    let (_, token) = subscribed_user(&harness, "ENTERPRISE").await;

    for _ in 0..25 {
        let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_i64(&response, "x-ratelimit-limit"), -1);
        assert_eq!(header_i64(&response, "x-ratelimit-remaining"), -1);
    }

    let usage = json_body(send(&harness.app, get("/api/v1/usage", Some(&token), None)).await).await;
    assert_eq!(usage["current_count"], 25);
    assert_eq!(usage["limit"], -1);
    assert_eq!(usage["remaining"], -1);
}

#[tokio::test]
async fn identity_failures_are_distinguished() {
    let harness = harness(Options::default());

    let anonymous = send(&harness.app, get("/api/v1/ping", None, None)).await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let forged = send(&harness.app, get("/api/v1/ping", Some("not-a-token"), None)).await;
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let unsubscribed = token(Uuid::new_v4());
    let response = send(&harness.app, get("/api/v1/ping", Some(&unsubscribed), None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().get("x-ratelimit-limit").is_none());

    let usage = send(&harness.app, get("/api/v1/usage", Some(&unsubscribed), None)).await;
    assert_eq!(usage.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn usage_report_is_not_metered() {
    let harness = harness(Options::default());
    let (_, token) = subscribed_user(&harness, "FREE").await;
    send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;

    for _ in 0..10 {
        let response = send(&harness.app, get("/api/v1/usage", Some(&token), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let usage = json_body(response).await;
        assert_eq!(usage["current_count"], 1);
        assert_eq!(usage["limit"], 3);
        assert_eq!(usage["remaining"], 2);
    }
}

#[tokio::test]
async fn burst_guard_runs_before_identity_and_resets() {
    let harness = harness(Options {
        burst: BurstGuardConfig {
            max_requests: 2,
            window: Duration::from_millis(300),
            max_tracked: 16,
        },
        ..Options::default()
    });
    let (_, token) = subscribed_user(&harness, "ENTERPRISE").await;
    let noisy = SocketAddr::from((Ipv4Addr::new(198, 51, 100, 7), 5000));
    let quiet = SocketAddr::from((Ipv4Addr::new(198, 51, 100, 8), 5000));

    for _ in 0..2 {
        let response = send(&harness.app, get("/api/v1/ping", Some(&token), Some(noisy))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = send(&harness.app, get("/api/v1/ping", Some(&token), Some(noisy))).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().get("x-ratelimit-limit").is_none());

    // Anonymous traffic from the same address is stopped before authentication.
    let anonymous = send(&harness.app, get("/api/v1/ping", None, Some(noisy))).await;
    assert_eq!(anonymous.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = send(&harness.app, get("/api/v1/ping", Some(&token), Some(quiet))).await;
    assert_eq!(other.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let recovered = send(&harness.app, get("/api/v1/ping", Some(&token), Some(noisy))).await;
    assert_eq!(recovered.status(), StatusCode::OK);
}

#[tokio::test]
async fn ledger_outage_fails_closed() {
    let harness = harness(Options::default());
    let (_, token) = subscribed_user(&harness, "FREE").await;
    harness.ledger.set_offline(true);

    let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    harness.ledger.set_offline(false);
    harness.ledger.set_latency(Duration::from_secs(1));
    let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn concurrent_requests_are_all_counted() {
    let harness = harness(Options {
        free_limit: 1_000,
        ..Options::default()
    });
    let (_, token) = subscribed_user(&harness, "FREE").await;

    let responses = join_all(
        (0..50).map(|_| send(&harness.app, get("/api/v1/ping", Some(&token), None))),
    )
    .await;
    assert!(responses.iter().all(|r| r.status() == StatusCode::OK));

    let usage = json_body(send(&harness.app, get("/api/v1/usage", Some(&token), None)).await).await;
    assert_eq!(usage["current_count"], 50);
}

#[tokio::test]
async fn every_admitted_request_is_counted_under_contention() {
    let harness = harness(Options {
        free_limit: 10,
        ..Options::default()
    });
    let (_, token) = subscribed_user(&harness, "FREE").await;

    let responses = join_all(
        (0..40).map(|_| send(&harness.app, get("/api/v1/ping", Some(&token), None))),
    )
    .await;
    let admitted = responses
        .iter()
        .filter(|r| r.status() == StatusCode::OK)
        .count() as i64;
    assert!(admitted >= 10);

    let usage = json_body(send(&harness.app, get("/api/v1/usage", Some(&token), None)).await).await;
    assert_eq!(usage["current_count"], admitted);
}

#[tokio::test]
async fn stale_window_rolls_forward_on_first_request() {
    let harness = harness(Options::default());
    let user_id = Uuid::new_v4();
    let now = Utc::now();
    let start = now - ChronoDuration::days(95);
    harness
        .ledger
        .upsert_subscription(subscription(
            user_id,
            "free",
            start,
            start + ChronoDuration::days(30),
        ))
        .await;
    let token = token(user_id);

    let response = send(&harness.app, get("/api/v1/ping", Some(&token), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_i64(&response, "x-ratelimit-remaining"), 2);
    assert!(header_i64(&response, "x-ratelimit-reset") > now.timestamp());

    let stored = harness.ledger.subscription(user_id).await.unwrap();
    assert!(stored.start_date <= now);
    assert!(stored.end_date.unwrap() > now);
}

#[tokio::test]
async fn concurrent_requests_on_stale_window_roll_once() {
    let harness = harness(Options {
        free_limit: 1_000,
        ..Options::default()
    });
    let user_id = Uuid::new_v4();
    let now = Utc::now();
    let start = now - ChronoDuration::days(200);
    harness
        .ledger
        .upsert_subscription(subscription(
            user_id,
            "FREE",
            start,
            start + ChronoDuration::days(30),
        ))
        .await;
    let token = token(user_id);

    let responses = join_all(
        (0..32).map(|_| send(&harness.app, get("/api/v1/ping", Some(&token), None))),
    )
    .await;
    assert!(responses.iter().all(|r| r.status() == StatusCode::OK));
    let resets: Vec<i64> = responses
        .iter()
        .map(|r| header_i64(r, "x-ratelimit-reset"))
        .collect();
    assert!(resets.iter().all(|reset| *reset == resets[0]));

    let stored = harness.ledger.subscription(user_id).await.unwrap();
    let stored_end = stored.end_date.unwrap();
    assert!(stored.start_date <= now && stored_end > now);
    assert_eq!(stored_end.timestamp(), resets[0]);

    let record = harness
        .ledger
        .get_current_usage(user_id, stored.start_date, stored_end)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.request_count, 32);
}

#[tokio::test]
async fn liveness_needs_no_credentials_and_skips_burst_gate() {
    let harness = harness(Options {
        burst: BurstGuardConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            max_tracked: 16,
        },
        ..Options::default()
    });
    let peer = SocketAddr::from((Ipv4Addr::new(192, 0, 2, 10), 6000));

    for _ in 0..5 {
        let response = send(&harness.app, get("/", None, Some(peer))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body, "Quota Gateway API".as_bytes());
    }
}
