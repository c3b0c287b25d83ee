//! HTTP handlers, grouped by surface.

pub mod admin;
pub mod health;
pub mod metrics;
pub mod seckill;
pub mod stock;

pub use admin::update_rate_limit;
pub use health::{health_check, ping};
pub use metrics::{metrics_export, metrics_reset, metrics_snapshot};
pub use seckill::{purchase, rollback_stock};
pub use stock::{get_stock, get_stocks};
