//! Public stock read endpoints.

use std::sync::Arc;

use axum::Extension;
use axum::extract::{Path, Query, State};

use super::super::state::AppState;
use super::super::types::{
    ApiError, ApiResult, MAX_BATCH_ACTIVITY_IDS, RequestId, StockData, StocksData, StocksQuery,
    ok, validate_id,
};
use crate::cache::keys;
use crate::error::SeckillError;

/// Live stock for one activity.
///
/// GET /api/v1/seckill/stock/{activity_id}
#[utoipa::path(
    get,
    path = "/api/v1/seckill/stock/{activity_id}",
    params(("activity_id" = String, Path, description = "Flash-sale activity id")),
    responses(
        (status = 200, description = "Current stock", body = StockData),
        (status = 404, description = "Unknown activity"),
        (status = 429, description = "Rate limited")
    ),
    tag = "Seckill"
)]
pub async fn get_stock(
    State(state): State<Arc<AppState>>,
    Path(activity_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<StockData> {
    validate_id("activity_id", &activity_id)
        .map_err(|msg| ApiError::invalid(msg, &request_id))?;

    if let Some(stock) = state
        .cache
        .get_stock(&activity_id)
        .await
        .map_err(|err| ApiError::new(err.into(), &request_id))?
    {
        return ok(
            &request_id,
            StockData {
                activity_id,
                stock: Some(stock),
            },
        );
    }

    // Cache miss: read through to the system of record once and warm the
    // counter for subsequent readers.
    let warmed = warm_stock_from_source(&state, &activity_id).await;
    match warmed {
        Some(stock) => ok(
            &request_id,
            StockData {
                activity_id,
                stock: Some(stock),
            },
        ),
        None => Err(ApiError::new(
            SeckillError::NotFound(activity_id),
            &request_id,
        )),
    }
}

/// Batch stock read, capped at [`MAX_BATCH_ACTIVITY_IDS`] ids.
///
/// GET /api/v1/seckill/stocks?activity_ids=a,b,c
#[utoipa::path(
    get,
    path = "/api/v1/seckill/stocks",
    params(("activity_ids" = String, Query, description = "Comma-separated activity ids, max 50")),
    responses(
        (status = 200, description = "Stock per requested activity", body = StocksData),
        (status = 400, description = "Invalid or too many ids"),
        (status = 429, description = "Rate limited")
    ),
    tag = "Seckill"
)]
pub async fn get_stocks(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<StocksQuery>,
) -> ApiResult<StocksData> {
    let ids: Vec<&str> = query
        .activity_ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if ids.is_empty() {
        return Err(ApiError::invalid("activity_ids must not be empty", &request_id));
    }
    if ids.len() > MAX_BATCH_ACTIVITY_IDS {
        return Err(ApiError::invalid(
            format!("at most {MAX_BATCH_ACTIVITY_IDS} activity_ids per request"),
            &request_id,
        ));
    }
    for id in &ids {
        validate_id("activity_ids", id).map_err(|msg| ApiError::invalid(msg, &request_id))?;
    }

    let mut stocks = Vec::with_capacity(ids.len());
    for id in ids {
        let stock = state
            .cache
            .get_stock(id)
            .await
            .map_err(|err| ApiError::new(err.into(), &request_id))?;
        stocks.push(StockData {
            activity_id: id.to_string(),
            stock,
        });
    }
    ok(&request_id, StocksData { stocks })
}

/// Load the authoritative stock value and seed the hot counter. Returns
/// None when the source has no record either (or none is registered).
async fn warm_stock_from_source(state: &AppState, activity_id: &str) -> Option<i64> {
    let loader = state.loader.as_ref()?;
    let raw = loader
        .load_from_source(&keys::stock(activity_id))
        .await
        .ok()??;
    let stock = raw.parse::<i64>().ok()?;

    let activity = match state.cache.get_activity(activity_id).await {
        Ok(Some(activity)) => Some(activity),
        _ => state.cache.refresh_activity(activity_id).await.ok().flatten(),
    }?;

    if let Err(err) = state
        .cache
        .seed_stock(activity_id, stock, activity.end_time)
        .await
    {
        tracing::warn!(target: "CACHE", activity_id, "stock warm-up write failed: {err}");
    }
    Some(stock)
}
