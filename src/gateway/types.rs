//! API response envelope, error mapping, and request/response DTOs.
//!
//! - `ApiResponse<T>`: uniform envelope `{success, message, data?,
//!   error_code?, timestamp, request_id}`
//! - `ApiResult<T>`: type alias for handler return types
//! - `ApiError`: `SeckillError` + request id with IntoResponse
//! - request validation helpers (id charset/length, quantity range)

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::SeckillError;

/// Maximum ids per batch stock read.
pub const MAX_BATCH_ACTIVITY_IDS: usize = 50;

/// Per-request correlation id, inserted by the request-id middleware and
/// echoed in every envelope and response header.
#[derive(Debug, Clone, Default)]
pub struct RequestId(pub String);

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Unified envelope
// ============================================================================

/// Uniform response wrapper. Every endpoint, success or failure, returns
/// this shape; clients discriminate on `error_code`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    /// Server time in milliseconds.
    pub timestamp: u64,
    pub request_id: String,
}

impl<T> ApiResponse<T> {
    pub fn success(request_id: &RequestId, data: T) -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
            data: Some(data),
            error_code: None,
            timestamp: now_ms(),
            request_id: request_id.0.clone(),
        }
    }
}

impl ApiResponse<serde_json::Value> {
    pub fn failure(
        request_id: &str,
        error_code: &'static str,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
            error_code: Some(error_code),
            timestamp: now_ms(),
            request_id: request_id.to_string(),
        }
    }
}

/// Handler return type: success tuple or an [`ApiError`] that renders the
/// failure envelope.
pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

/// 200 OK helper.
#[inline]
pub fn ok<T: Serialize>(request_id: &RequestId, data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(request_id, data))))
}

// ============================================================================
// ApiError
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub error: SeckillError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: SeckillError, request_id: &RequestId) -> Self {
        Self {
            error,
            request_id: request_id.0.clone(),
        }
    }

    pub fn invalid(message: impl Into<String>, request_id: &RequestId) -> Self {
        Self::new(SeckillError::InvalidParameter(message.into()), request_id)
    }
}

/// Status-code mapping for the error taxonomy.
pub fn http_status(error: &SeckillError) -> StatusCode {
    match error {
        SeckillError::InvalidParameter(_)
        | SeckillError::NotActive
        | SeckillError::NotStarted
        | SeckillError::Ended => StatusCode::BAD_REQUEST,
        SeckillError::Unauthorized => StatusCode::UNAUTHORIZED,
        SeckillError::NotFound(_) => StatusCode::NOT_FOUND,
        SeckillError::OutOfStock { .. } | SeckillError::UserLimitExceeded { .. } => {
            StatusCode::CONFLICT
        }
        SeckillError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        SeckillError::Saturated
        | SeckillError::BrokerUnavailable(_)
        | SeckillError::StoreUnavailable(_)
        | SeckillError::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
        SeckillError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.error);

        // Payload-carrying rejections keep their counters in `data` so the
        // UI can render them without parsing the message.
        let data = match &self.error {
            SeckillError::OutOfStock { remaining } => {
                Some(serde_json::json!({ "remaining_stock": remaining }))
            }
            SeckillError::UserLimitExceeded { purchased } => {
                Some(serde_json::json!({ "user_purchased": purchased }))
            }
            SeckillError::RateLimited {
                tier,
                retry_after_secs,
            } => Some(serde_json::json!({
                "tier": tier.as_str(),
                "retry_after": retry_after_secs,
            })),
            _ => None,
        };

        let envelope = ApiResponse::failure(
            &self.request_id,
            self.error.error_code(),
            self.error.to_string(),
            data,
        );

        let mut response = (status, Json(envelope)).into_response();
        if let SeckillError::RateLimited {
            retry_after_secs, ..
        } = self.error
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// JSON body extractor that keeps malformed input inside the uniform
/// envelope instead of axum's plain-text rejection.
pub struct ValidJson<T>(pub T);

impl<S, T> axum::extract::FromRequest<S> for ValidJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .cloned()
            .unwrap_or_default();
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidJson(value)),
            Err(rejection) => Err(ApiError::new(
                SeckillError::InvalidParameter(rejection.body_text()),
                &request_id,
            )),
        }
    }
}

// ============================================================================
// Request DTOs + validation
// ============================================================================

/// Purchase request body.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PurchaseBody {
    /// Buyer identity (alphanumeric plus `_-`, 1..50 chars).
    #[schema(example = "user_1024")]
    pub user_id: String,
    /// Units to reserve, 1..100.
    #[schema(example = 1)]
    pub purchase_amount: u32,
    /// Optional tightening of the activity's per-user cap.
    #[serde(default)]
    pub user_limit: Option<u32>,
}

/// Batch stock query: `?activity_ids=a,b,c`.
#[derive(Debug, Deserialize)]
pub struct StocksQuery {
    pub activity_ids: String,
}

/// Id format shared by activity and user ids: alphanumeric plus `_-`,
/// length 1..=50.
pub fn validate_id(label: &str, value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > 50 {
        return Err(format!("{label} must be 1..50 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(format!(
            "{label} may only contain letters, digits, '_' and '-'"
        ));
    }
    Ok(())
}

pub fn validate_purchase(body: &PurchaseBody) -> Result<(), String> {
    validate_id("user_id", &body.user_id)?;
    if body.purchase_amount == 0 || body.purchase_amount > 100 {
        return Err("purchase_amount must be within 1..100".to_string());
    }
    if body.user_limit == Some(0) {
        return Err("user_limit must be at least 1".to_string());
    }
    Ok(())
}

/// Optional `X-Idempotency-Key` header value; same charset as ids but up to
/// 64 characters.
pub fn validate_idempotency_key(value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > 64 {
        return Err("idempotency key must be 1..64 characters".to_string());
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("idempotency key may only contain letters, digits, '_' and '-'".to_string());
    }
    Ok(())
}

// ============================================================================
// Response DTOs
// ============================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct PurchaseData {
    pub order_id: String,
    pub activity_id: String,
    pub remaining_stock: i64,
    pub user_purchased: i64,
    /// True when this response replays a recorded idempotent decision.
    pub replayed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StockData {
    pub activity_id: String,
    /// Live counter; null when the activity is unknown to the hot store.
    pub stock: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StocksData {
    pub stocks: Vec<StockData>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RollbackData {
    pub activity_id: String,
    pub stock: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::Tier;

    #[test]
    fn test_validate_id_charset_and_length() {
        assert!(validate_id("activity_id", "act_2024-06").is_ok());
        assert!(validate_id("activity_id", "").is_err());
        assert!(validate_id("activity_id", &"x".repeat(51)).is_err());
        assert!(validate_id("activity_id", "bad id").is_err());
        assert!(validate_id("activity_id", "semi;colon").is_err());
    }

    #[test]
    fn test_validate_purchase_ranges() {
        let mut body = PurchaseBody {
            user_id: "u1".to_string(),
            purchase_amount: 1,
            user_limit: None,
        };
        assert!(validate_purchase(&body).is_ok());

        body.purchase_amount = 0;
        assert!(validate_purchase(&body).is_err());
        body.purchase_amount = 101;
        assert!(validate_purchase(&body).is_err());
        body.purchase_amount = 100;
        assert!(validate_purchase(&body).is_ok());

        body.user_limit = Some(0);
        assert!(validate_purchase(&body).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            http_status(&SeckillError::OutOfStock { remaining: 0 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            http_status(&SeckillError::RateLimited {
                tier: Tier::User,
                retry_after_secs: 1
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            http_status(&SeckillError::NotFound("a".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(http_status(&SeckillError::Saturated), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            http_status(&SeckillError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_envelope_shape() {
        let rid = RequestId("req-1".to_string());
        let env = ApiResponse::success(&rid, serde_json::json!({"k": 1}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["request_id"], "req-1");
        assert!(json.get("error_code").is_none());

        let failure = ApiResponse::failure("req-2", "OutOfStock", "out of stock", None);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "OutOfStock");
        assert!(json.get("data").is_none());
    }
}
