//! seckill-engine: flash-sale admission and reservation engine.
//!
//! A network service that admits a burst of concurrent purchase attempts
//! against a fixed inventory, deterministically picks winners without
//! overselling, enforces per-user caps, rejects excess traffic early, and
//! hands winning requests to an asynchronous order pipeline.
//!
//! # Modules
//!
//! - [`store`] - hot store client (redis counters + atomic scripts)
//! - [`dispatch`] - durable reservation-event publish (NATS JetStream)
//! - [`limiter`] - three-tier token-bucket admission control
//! - [`cache`] - typed cache manager, TTL policy, write strategies
//! - [`validator`] - activity state-machine validation
//! - [`reservation`] - the reservation engine with compensating rollback
//! - [`reconciler`] - cache ↔ system-of-record consistency loop
//! - [`metrics`] - in-process counters, latency aggregates, alerts
//! - [`worker`] - bounded concurrent executor
//! - [`gateway`] - HTTP front: routes, middleware, envelope
//! - [`config`] / [`logging`] / [`error`] / [`model`] / [`source`] - ambient

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod reservation;
pub mod source;
pub mod store;
pub mod validator;
pub mod worker;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use error::SeckillError;
pub use metrics::MetricsCollector;
pub use model::{Activity, ActivityStatus, ReservationEvent};
pub use reservation::{PurchaseReceipt, PurchaseRequest, ReservationEngine};
pub use store::{HotStore, MemoryStore, RedisStore, ReserveOutcome};
