use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheManager;
use crate::limiter::MultiTierLimiter;
use crate::metrics::MetricsCollector;
use crate::reservation::ReservationEngine;
use crate::source::DataLoader;
use crate::store::HotStore;
use crate::worker::WorkerPool;

/// Gateway application state (shared).
///
/// Components hold no references to each other's in-memory state; everything
/// shared lives in the hot store behind [`HotStore`].
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReservationEngine>,
    pub limiter: Arc<MultiTierLimiter>,
    pub cache: Arc<CacheManager>,
    pub metrics: Arc<MetricsCollector>,
    pub pool: Arc<WorkerPool>,
    pub store: Arc<dyn HotStore>,
    /// System-of-record loader for read-through and admin rollback.
    pub loader: Option<Arc<dyn DataLoader>>,
    /// Bearer token guarding admin endpoints; None disables them.
    pub admin_token: Option<String>,
    /// Budget for one purchase request, admission to response.
    pub request_deadline: Duration,
}
