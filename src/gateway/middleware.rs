//! Middleware chain, outermost first: panic recovery, request id, access
//! log, CORS (layered in `mod.rs`), security headers, metrics observer, and
//! the read-path rate limit applied to the public stock routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use uuid::Uuid;

use super::state::AppState;
use super::types::{ApiError, RequestId};
use crate::error::SeckillError;
use crate::limiter::Decision;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Outermost layer: a panicking handler becomes a 500 envelope and the
/// process stays up.
pub async fn recovery(request: Request<Body>, next: Next) -> Response {
    let request_id = header_request_id(&request).unwrap_or_else(|| "unknown".to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(&panic);
            tracing::error!(
                target: "HTTP",
                request_id = %request_id,
                %method,
                path = %path,
                "handler panicked: {detail}"
            );
            ApiError {
                error: SeckillError::Internal("internal server error".to_string()),
                request_id,
            }
            .into_response()
        }
    }
}

/// Take the caller's `X-Request-Id` when well-formed, otherwise mint one.
/// The id rides the request extensions and is echoed as a response header.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let rid = header_request_id(&request).unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(rid.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn access_log(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;

    tracing::info!(
        target: "HTTP",
        %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        request_id = %request_id,
        "request"
    );
    response
}

pub async fn security_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}

/// Per-request latency and 5xx counting into the metrics collector.
pub async fn metrics_observer(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.observe("http", started.elapsed());
    if response.status().is_server_error() {
        state.metrics.record_error();
    }
    response
}

/// Global + address tiers for the public stock reads, where no user
/// identity exists. The purchase handler runs the full three-tier check
/// itself because the user id lives in the request body.
pub async fn read_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default();
    let address = client_address(&request);

    match state.limiter.allow_address(&address) {
        Decision::Allowed => next.run(request).await,
        Decision::Rejected {
            tier,
            retry_after_secs,
        } => ApiError::new(
            SeckillError::RateLimited {
                tier,
                retry_after_secs,
            },
            &request_id,
        )
        .into_response(),
    }
}

/// Source address for the address-tier bucket: first `X-Forwarded-For` hop
/// when present (reverse-proxy deployments), else the socket peer.
pub fn client_address(request: &Request<Body>) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    address_from_parts(request.headers(), peer)
}

pub fn address_from_parts(
    headers: &axum::http::HeaderMap,
    peer: Option<std::net::IpAddr>,
) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_request_id(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| {
            !v.is_empty() && v.len() <= 64 && v.chars().all(|c| c.is_ascii_graphic())
        })
        .map(str::to_string)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bearer-token check for administrative endpoints. With no token
/// configured the endpoints stay disabled.
pub fn check_admin(state: &AppState, headers: &axum::http::HeaderMap) -> Result<(), SeckillError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(SeckillError::Unauthorized);
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(SeckillError::Unauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_address_prefers_forwarded_header() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address(&request), "203.0.113.7");
    }

    #[test]
    fn test_client_address_falls_back_to_peer() {
        let mut request = Request::builder().body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.9:4711".parse().unwrap()));
        assert_eq!(client_address(&request), "192.0.2.9");
    }

    #[test]
    fn test_header_request_id_rejects_garbage() {
        let request = Request::builder()
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(header_request_id(&request).as_deref(), Some("abc-123"));

        let request = Request::builder()
            .header("x-request-id", "a".repeat(100))
            .body(Body::empty())
            .unwrap();
        assert_eq!(header_request_id(&request), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secr"));
    }
}
