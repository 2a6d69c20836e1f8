use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use quota_gateway::{
    auth::IdentityResolver,
    billing::{PgUsageLedger, UsageLedger},
    cache::{self, MemoryResponseCache},
    config,
    ratelimit::{spawn_eviction, BurstGuard, DecisionPoint},
    router, AppState,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let jwt_secret = config::JWT_SECRET
        .clone()
        .context("JWT_SECRET must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to DATABASE_URL")?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("database migrations failed");
        }
    }

    let periods = config::period_calculator_from_env();
    let settings = config::rate_limit_settings_from_env();
    let ledger: Arc<dyn UsageLedger> = Arc::new(PgUsageLedger::new(pool.clone(), periods));
    let burst = BurstGuard::new(config::burst_config_from_env());
    spawn_eviction(burst.clone());
    let response_cache = Arc::new(MemoryResponseCache::new(config::response_cache_ttl()));
    cache::spawn_eviction(response_cache.clone());

    let state = AppState {
        decision: DecisionPoint::new(
            ledger.clone(),
            config::plan_limits_from_env(),
            periods,
            burst,
            settings,
        ),
        identity: IdentityResolver::new(ledger, &jwt_secret, settings.ledger_timeout),
        cache: response_cache,
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(router(state))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid BIND_ADDRESS/BIND_PORT")?;
    info!(
        %addr,
        billing_period = periods.interval().as_str(),
        "Listening for incoming connections"
    );
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
