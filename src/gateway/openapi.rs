//! OpenAPI / Swagger UI documentation.
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use super::types::{HealthData, PurchaseBody, PurchaseData, RollbackData, StockData, StocksData};

/// Static bearer-token scheme for the administrative endpoints.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "admin_token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "Authorization",
                    "Admin bearer token: `Bearer {ADMIN_TOKEN}`",
                ))),
            );
        }
    }
}

/// Main API documentation struct.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Seckill Engine API",
        version = "1.0.0",
        description = "Flash-sale admission and reservation engine: rate-limited purchase \
                       endpoint with atomic stock reservation and asynchronous order dispatch.",
        license(name = "MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::seckill::purchase,
        crate::gateway::handlers::seckill::rollback_stock,
        crate::gateway::handlers::stock::get_stock,
        crate::gateway::handlers::stock::get_stocks,
        crate::gateway::handlers::health::health_check,
        crate::gateway::handlers::health::ping,
    ),
    components(
        schemas(
            PurchaseBody,
            PurchaseData,
            StockData,
            StocksData,
            RollbackData,
            HealthData,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Seckill", description = "Purchase and stock endpoints"),
        (name = "System", description = "Health and liveness")
    )
)]
pub struct ApiDoc;
