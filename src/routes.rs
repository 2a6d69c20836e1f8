use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    middleware::from_fn_with_state,
    response::Response,
    routing::get,
    Extension, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::auth::{resolve_identity, IdentityResolver};
use crate::billing;
use crate::cache::{read_through, ResponseCache};
use crate::error::{AppError, AppResult};
use crate::ratelimit::{enforce_burst_limit, enforce_quota, DecisionPoint, ResolvedIdentity};

#[derive(Clone)]
pub struct AppState {
    pub decision: DecisionPoint,
    pub identity: IdentityResolver,
    pub cache: Arc<dyn ResponseCache>,
}

impl FromRef<AppState> for DecisionPoint {
    fn from_ref(state: &AppState) -> Self {
        state.decision.clone()
    }
}

impl FromRef<AppState> for Arc<dyn ResponseCache> {
    fn from_ref(state: &AppState) -> Self {
        state.cache.clone()
    }
}

pub async fn root() -> &'static str {
    "Quota Gateway API"
}

/// Liveness plus the API. `/` sits outside every gate so health checks never consume
/// burst budget.
pub fn router(state: AppState) -> Router {
    Router::new().route("/", get(root)).merge(api_routes(state))
}

// key: api-routes -> burst gate, identity, then quota on metered routes
pub fn api_routes(state: AppState) -> Router {
    let metered = Router::new()
        .route("/api/v1/ping", get(ping))
        .route_layer(from_fn_with_state(state.decision.clone(), enforce_quota));

    Router::new()
        .route("/api/v1/usage", get(billing::billing_current_usage))
        .merge(metered)
        .layer(from_fn_with_state(state.identity.clone(), resolve_identity))
        .layer(from_fn_with_state(state.decision.clone(), enforce_burst_limit))
        .with_state(state)
}

/// Metered endpoint served through the response cache.
async fn ping(
    State(cache): State<Arc<dyn ResponseCache>>,
    Extension(identity): Extension<ResolvedIdentity>,
) -> AppResult<Response> {
    let user_id = identity.user_id;
    let key = format!("ping:{user_id}");
    read_through(cache.as_ref(), &key, || async move {
        Ok::<_, AppError>(json!({
            "message": "pong",
            "user_id": user_id,
            "generated_at": Utc::now(),
        }))
    })
    .await
}
