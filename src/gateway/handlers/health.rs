//! Health and liveness handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Extension;
use axum::extract::State;

use super::super::state::AppState;
use super::super::types::{ApiError, ApiResult, HealthData, RequestId, now_ms, ok};
use crate::error::SeckillError;

/// Health check with a rate-limited hot-store ping.
///
/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthData),
        (status = 503, description = "Hot store unreachable")
    ),
    tag = "System"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<HealthData> {
    // Ping the store at most once per interval; in between, report healthy.
    static LAST_CHECK_MS: AtomicU64 = AtomicU64::new(0);
    const CHECK_INTERVAL_MS: u64 = 5_000;

    let now = now_ms();
    let last = LAST_CHECK_MS.load(Ordering::Relaxed);
    if now.saturating_sub(last) > CHECK_INTERVAL_MS {
        LAST_CHECK_MS.store(now, Ordering::Relaxed);
        if let Err(err) = state.store.get("seckill:health:probe").await {
            tracing::error!(target: "HTTP", "health probe failed: {err}");
            return Err(ApiError::new(
                SeckillError::StoreUnavailable(err.to_string()),
                &request_id,
            ));
        }
    }

    ok(
        &request_id,
        HealthData {
            status: "ok".to_string(),
            version: env!("GIT_HASH").to_string(),
            timestamp_ms: now,
        },
    )
}

/// Trivial liveness probe.
///
/// GET /ping
#[utoipa::path(
    get,
    path = "/ping",
    responses((status = 200, description = "Always pong")),
    tag = "System"
)]
pub async fn ping(Extension(request_id): Extension<RequestId>) -> ApiResult<String> {
    ok(&request_id, "pong".to_string())
}
