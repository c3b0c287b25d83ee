//! HTTP front: route table, middleware chain, server lifecycle.

pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod state;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use state::AppState;

/// Assemble the full router with the middleware chain.
///
/// Layer order below is innermost-first; at runtime the chain runs
/// panic-recovery → request-id → access log → CORS → security headers →
/// metrics observer → route (rate limiting on the public stock routes,
/// parameter validation and admission inside the handlers).
pub fn build_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let stock_routes = Router::new()
        .route("/stock/{activity_id}", get(handlers::get_stock))
        .route("/stocks", get(handlers::get_stocks))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::read_rate_limit,
        ));

    let seckill_routes = Router::new()
        .route("/{activity_id}", post(handlers::purchase))
        .route("/rollback/{activity_id}", post(handlers::rollback_stock))
        .merge(stock_routes);

    let admin_routes = Router::new()
        .route("/metrics", get(handlers::metrics_snapshot))
        .route("/metrics/export", get(handlers::metrics_export))
        .route("/metrics/reset", post(handlers::metrics_reset))
        .route("/rate_limit/{tier}", post(handlers::update_rate_limit));

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ping", get(handlers::ping))
        .nest("/api/v1/seckill", seckill_routes)
        .nest("/api/v1/admin", admin_routes)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::metrics_observer,
        ))
        .layer(from_fn(middleware::security_headers))
        .layer(build_cors(cors_origins))
        .layer(from_fn(middleware::access_log))
        .layer(from_fn(middleware::request_id))
        .layer(from_fn(middleware::recovery))
        .with_state(state);

    router.merge(
        SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
    )
}

/// Origin allowlist is deployment config; an empty list means a permissive
/// development policy.
fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(target: "HTTP", origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Bind and serve until the shutdown future resolves.
pub async fn run_server(
    state: Arc<AppState>,
    port: u16,
    cors_origins: &[String],
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state, cors_origins);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(target: "HTTP", %addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
