//! Metrics export and reset handlers.

use std::sync::Arc;

use axum::Extension;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;

use super::super::middleware::check_admin;
use super::super::state::AppState;
use super::super::types::{ApiError, ApiResult, RequestId, ok};
use crate::metrics::{MetricsCollector, MetricsSnapshot};

/// Full JSON snapshot.
///
/// GET /api/v1/admin/metrics
pub async fn metrics_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<MetricsSnapshot> {
    ok(&request_id, state.metrics.snapshot())
}

/// Flat `key=value` rendering for scrapers; plain text, no envelope.
///
/// GET /api/v1/admin/metrics/export
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let text = MetricsCollector::export_text(&state.metrics.snapshot());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
}

/// Zero all counters. Requires the admin bearer token.
///
/// POST /api/v1/admin/metrics/reset
pub async fn metrics_reset(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    check_admin(&state, &headers).map_err(|err| ApiError::new(err, &request_id))?;
    state.metrics.reset();
    tracing::info!(target: "METRICS", request_id = %request_id.0, "counters reset by operator");
    ok(&request_id, serde_json::json!({ "reset": true }))
}
