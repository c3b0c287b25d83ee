//! Purchase and administrative rollback handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Extension;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;

use super::super::middleware::{address_from_parts, check_admin};
use super::super::state::AppState;
use super::super::types::{
    ApiError, ApiResult, PurchaseBody, PurchaseData, RequestId, RollbackData, ValidJson, ok,
    validate_id, validate_idempotency_key, validate_purchase,
};
use crate::cache::keys;
use crate::error::SeckillError;
use crate::limiter::Decision;
use crate::reservation::PurchaseRequest;
use crate::worker::SubmitError;

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Main purchase endpoint.
///
/// POST /api/v1/seckill/{activity_id}
#[utoipa::path(
    post,
    path = "/api/v1/seckill/{activity_id}",
    request_body = PurchaseBody,
    params(("activity_id" = String, Path, description = "Flash-sale activity id")),
    responses(
        (status = 200, description = "Reservation accepted and dispatched", body = PurchaseData),
        (status = 400, description = "Invalid parameters or activity window closed"),
        (status = 404, description = "Unknown activity"),
        (status = 409, description = "Out of stock or per-user limit exceeded"),
        (status = 429, description = "Rate limited; tier and retry hint in the envelope"),
        (status = 503, description = "Saturated or downstream unavailable")
    ),
    tag = "Seckill"
)]
pub async fn purchase(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(activity_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    ValidJson(body): ValidJson<PurchaseBody>,
) -> ApiResult<PurchaseData> {
    // Parameter validation first; admission control works on trusted ids.
    validate_id("activity_id", &activity_id)
        .and_then(|_| validate_purchase(&body))
        .map_err(|msg| ApiError::invalid(msg, &request_id))?;

    let idempotency_key = match headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(raw) => {
            validate_idempotency_key(raw).map_err(|msg| ApiError::invalid(msg, &request_id))?;
            Some(raw.to_string())
        }
        None => None,
    };

    // Admission: all three tiers in one decision, first failing tier named.
    let address = address_from_parts(&headers, Some(peer.ip()));
    if let Decision::Rejected {
        tier,
        retry_after_secs,
    } = state.limiter.allow(&address, &body.user_id)
    {
        return Err(ApiError::new(
            SeckillError::RateLimited {
                tier,
                retry_after_secs,
            },
            &request_id,
        ));
    }

    let request = PurchaseRequest {
        activity_id: activity_id.clone(),
        user_id: body.user_id.clone(),
        quantity: body.purchase_amount,
        user_limit: body.user_limit,
        idempotency_key,
    };

    // The reservation pipeline runs on the bounded worker pool; a full
    // queue is the backpressure signal, not a reason to block the socket.
    let engine = Arc::clone(&state.engine);
    let receiver = state
        .pool
        .submit(async move { engine.reserve(&request).await })
        .map_err(|err| match err {
            SubmitError::Saturated => ApiError::new(SeckillError::Saturated, &request_id),
            SubmitError::Closed => ApiError::new(
                SeckillError::Internal("worker pool closed".to_string()),
                &request_id,
            ),
        })?;

    let grace = state.request_deadline + std::time::Duration::from_millis(500);
    let outcome = tokio::time::timeout(grace, receiver)
        .await
        .map_err(|_| ApiError::new(SeckillError::DeadlineExceeded, &request_id))?
        .map_err(|_| {
            ApiError::new(
                SeckillError::Internal("reservation task dropped".to_string()),
                &request_id,
            )
        })?;

    let receipt = outcome.map_err(|err| ApiError::new(err, &request_id))?;
    ok(
        &request_id,
        PurchaseData {
            order_id: receipt.order_id,
            activity_id: receipt.activity_id,
            remaining_stock: receipt.remaining_stock,
            user_purchased: receipt.user_purchased,
            replayed: receipt.replayed,
        },
    )
}

/// Administrative stock rollback: reset the live counter from the system of
/// record (or the activity's total stock when no source is registered).
///
/// POST /api/v1/seckill/rollback/{activity_id}
#[utoipa::path(
    post,
    path = "/api/v1/seckill/rollback/{activity_id}",
    params(("activity_id" = String, Path, description = "Flash-sale activity id")),
    responses(
        (status = 200, description = "Counter reset", body = RollbackData),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 404, description = "Unknown activity")
    ),
    security(("admin_token" = [])),
    tag = "Seckill"
)]
pub async fn rollback_stock(
    State(state): State<Arc<AppState>>,
    Path(activity_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<RollbackData> {
    check_admin(&state, &headers).map_err(|err| ApiError::new(err, &request_id))?;
    validate_id("activity_id", &activity_id)
        .map_err(|msg| ApiError::invalid(msg, &request_id))?;

    let activity = match state
        .cache
        .get_activity(&activity_id)
        .await
        .map_err(|err| ApiError::new(err.into(), &request_id))?
    {
        Some(activity) => activity,
        None => state
            .cache
            .refresh_activity(&activity_id)
            .await
            .map_err(|err| ApiError::new(err.into(), &request_id))?
            .ok_or_else(|| {
                ApiError::new(SeckillError::NotFound(activity_id.clone()), &request_id)
            })?,
    };

    let stock = match &state.loader {
        Some(loader) => match loader
            .load_from_source(&keys::stock(&activity_id))
            .await
            .map_err(|err| {
                ApiError::new(
                    SeckillError::StoreUnavailable(format!("system of record: {err}")),
                    &request_id,
                )
            })? {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                ApiError::new(
                    SeckillError::Internal(format!(
                        "system of record returned non-integer stock for {activity_id}"
                    )),
                    &request_id,
                )
            })?,
            None => i64::from(activity.total_stock),
        },
        None => i64::from(activity.total_stock),
    };

    // Write-through when a source writer is registered: the reset only
    // succeeds once the system of record has it too.
    state
        .cache
        .reset_stock(&activity_id, stock, activity.end_time)
        .await
        .map_err(|err| ApiError::new(err.into(), &request_id))?;

    tracing::info!(
        target: "HTTP",
        activity_id = %activity_id,
        stock,
        request_id = %request_id.0,
        "administrative stock rollback"
    );
    ok(&request_id, RollbackData { activity_id, stock })
}
