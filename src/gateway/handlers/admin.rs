//! Administrative rate-limit configuration.

use std::sync::Arc;

use axum::Extension;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use utoipa::ToSchema;

use super::super::middleware::check_admin;
use super::super::state::AppState;
use super::super::types::{ApiError, ApiResult, RequestId, ValidJson, ok};
use crate::limiter::{BucketSpec, Tier};

/// New template for one tier. Capacity defaults to one second of refill.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RateLimitSpecBody {
    /// Refill rate in tokens per second.
    pub qps: f64,
    #[serde(default)]
    pub capacity: Option<f64>,
}

/// Hot-swap one rate-limit tier. Existing buckets keep their template; new
/// buckets pick the update up.
///
/// POST /api/v1/admin/rate_limit/{tier}
pub async fn update_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(tier): Path<String>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    ValidJson(body): ValidJson<RateLimitSpecBody>,
) -> ApiResult<serde_json::Value> {
    check_admin(&state, &headers).map_err(|err| ApiError::new(err, &request_id))?;

    let tier = match tier.as_str() {
        "global" => Tier::Global,
        "address" => Tier::Address,
        "user" => Tier::User,
        other => {
            return Err(ApiError::invalid(
                format!("unknown tier {other:?}, expected global|address|user"),
                &request_id,
            ));
        }
    };
    if !body.qps.is_finite() || body.qps <= 0.0 {
        return Err(ApiError::invalid("qps must be > 0", &request_id));
    }
    let capacity = match body.capacity {
        Some(capacity) if capacity.is_finite() && capacity >= 1.0 => capacity,
        Some(_) => return Err(ApiError::invalid("capacity must be >= 1", &request_id)),
        None => body.qps.max(1.0),
    };

    state.limiter.update_tier(
        tier,
        BucketSpec {
            capacity,
            refill_rate: body.qps,
        },
    );

    ok(
        &request_id,
        serde_json::json!({
            "tier": tier.as_str(),
            "qps": body.qps,
            "capacity": capacity,
        }),
    )
}
