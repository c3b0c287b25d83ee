//! Reservation engine: the atomic reserve decision, the dispatch to the
//! order pipeline, and the compensating rollback when dispatch fails.
//!
//! ```text
//! Admitted → Validated → Reserved → Dispatched → Done
//!            │           │          │
//!            └─Rejected  └─RolledBack (if dispatch fails)
//! ```
//!
//! The reserve/release scripts are the only mutators of the stock and user
//! counters on this path; ordering across requests is whatever order the hot
//! store executes the scripts in. Store and broker transients are retried
//! with exponential backoff, bounded by the request deadline; an elapsed
//! deadline after the script has run is treated exactly like a dispatch
//! failure and rolled back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::time::timeout;
use uuid::Uuid;

use crate::cache::{CacheManager, keys};
use crate::dispatch::{DispatchError, EventDispatcher};
use crate::error::SeckillError;
use crate::metrics::MetricsCollector;
use crate::model::{Activity, ReservationEvent, ReservationState};
use crate::store::{HotStore, IdempotencySpec, ReserveOutcome, ReserveRequest, StoreError};
use crate::validator::ActivityValidator;

#[derive(Debug, Clone, Copy)]
pub struct ReservationConfig {
    /// Total budget for one purchase request, admission to response.
    pub deadline: Duration,
    /// Retry attempts for transient store/broker failures.
    pub max_retries: u32,
    pub retry_base: Duration,
    /// Lifetime of a recorded idempotent decision.
    pub idempotency_ttl: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(2),
            max_retries: 3,
            retry_base: Duration::from_millis(50),
            idempotency_ttl: Duration::from_secs(300),
        }
    }
}

/// One purchase attempt, already syntax-validated by the gateway.
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub activity_id: String,
    pub user_id: String,
    pub quantity: u32,
    /// Optional per-request cap; can only tighten the activity's limit.
    pub user_limit: Option<u32>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseReceipt {
    pub order_id: String,
    pub activity_id: String,
    pub user_id: String,
    pub quantity: u32,
    pub remaining_stock: i64,
    pub user_purchased: i64,
    /// True when served from a recorded idempotent decision; the original
    /// dispatch already happened.
    pub replayed: bool,
}

pub struct ReservationEngine {
    store: Arc<dyn HotStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    cache: Arc<CacheManager>,
    validator: ActivityValidator,
    metrics: Arc<MetricsCollector>,
    sequence: AtomicU64,
    config: ReservationConfig,
}

impl ReservationEngine {
    pub fn new(
        store: Arc<dyn HotStore>,
        dispatcher: Arc<dyn EventDispatcher>,
        cache: Arc<CacheManager>,
        metrics: Arc<MetricsCollector>,
        config: ReservationConfig,
    ) -> Self {
        let validator = ActivityValidator::new(Arc::clone(&cache));
        Self {
            store,
            dispatcher,
            cache,
            validator,
            metrics,
            sequence: AtomicU64::new(0),
            config,
        }
    }

    /// Run one purchase attempt through the full pipeline.
    pub async fn reserve(&self, req: &PurchaseRequest) -> Result<PurchaseReceipt, SeckillError> {
        let started = Instant::now();
        let deadline_at = started + self.config.deadline;
        self.metrics.record_request(&req.activity_id);

        let result = self.reserve_inner(req, deadline_at).await;
        self.metrics.observe("reserve", started.elapsed());
        match &result {
            Ok(receipt) => {
                self.metrics.record_success(&req.activity_id);
                tracing::info!(
                    target: "RESERVE",
                    activity_id = %req.activity_id,
                    user_id = %req.user_id,
                    order_id = %receipt.order_id,
                    remaining = receipt.remaining_stock,
                    state = ReservationState::Done.as_str(),
                    "reservation complete"
                );
            }
            Err(err) => {
                self.metrics.record_failure(&req.activity_id);
                tracing::debug!(
                    target: "RESERVE",
                    activity_id = %req.activity_id,
                    user_id = %req.user_id,
                    error_code = err.error_code(),
                    "reservation rejected"
                );
            }
        }
        result
    }

    async fn reserve_inner(
        &self,
        req: &PurchaseRequest,
        deadline_at: Instant,
    ) -> Result<PurchaseReceipt, SeckillError> {
        let activity = self.validator.validate(&req.activity_id).await?;
        tracing::debug!(
            target: "RESERVE",
            activity_id = %req.activity_id,
            state = ReservationState::Validated.as_str(),
            "validation passed"
        );

        let per_user_limit = req
            .user_limit
            .map(|limit| limit.min(activity.per_user_limit))
            .unwrap_or(activity.per_user_limit);

        let order_id = Uuid::new_v4().to_string();
        let outcome = self
            .run_script(req, &activity, per_user_limit, &order_id, deadline_at)
            .await?;

        let (remaining_stock, user_purchased, decided_order_id) = match outcome {
            ReserveOutcome::Ok {
                remaining_stock,
                user_purchased,
                order_id,
            } => (remaining_stock, user_purchased, order_id),
            ReserveOutcome::InsufficientStock { remaining_stock } => {
                self.metrics.set_stock(&req.activity_id, remaining_stock);
                return Err(SeckillError::OutOfStock {
                    remaining: remaining_stock,
                });
            }
            ReserveOutcome::ExceedsUserLimit { user_purchased } => {
                return Err(SeckillError::UserLimitExceeded {
                    purchased: user_purchased,
                });
            }
            ReserveOutcome::Inactive => return Err(SeckillError::NotActive),
        };
        self.metrics.set_stock(&req.activity_id, remaining_stock);

        let receipt = PurchaseReceipt {
            order_id: decided_order_id.clone(),
            activity_id: req.activity_id.clone(),
            user_id: req.user_id.clone(),
            quantity: req.quantity,
            remaining_stock,
            user_purchased,
            replayed: decided_order_id != order_id,
        };

        if receipt.replayed {
            // Recorded decision from a previous submission; the event for it
            // was already dispatched (or compensated) back then.
            tracing::debug!(
                target: "RESERVE",
                order_id = %receipt.order_id,
                "idempotent replay served from recorded decision"
            );
            return Ok(receipt);
        }

        tracing::debug!(
            target: "RESERVE",
            order_id = %receipt.order_id,
            state = ReservationState::Reserved.as_str(),
            "stock reserved"
        );
        // Write-behind to the system of record; the hot-store counter is
        // the one the script just produced. Replays are excluded above so a
        // recorded old value never overtakes a newer one in the drain queue.
        self.cache
            .propagate_stock(&req.activity_id, remaining_stock);

        let event = ReservationEvent {
            activity_id: req.activity_id.clone(),
            user_id: req.user_id.clone(),
            quantity: req.quantity,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            order_id: receipt.order_id.clone(),
            created_at: Utc::now(),
        };

        match self.dispatch(&event, deadline_at).await {
            Ok(()) => {
                tracing::debug!(
                    target: "RESERVE",
                    order_id = %event.order_id,
                    sequence = event.sequence,
                    state = ReservationState::Dispatched.as_str(),
                    "event dispatched"
                );
                Ok(receipt)
            }
            Err(err) => {
                self.compensate(req, &activity, &event).await;
                Err(err)
            }
        }
    }

    /// Execute the reservation script, retrying transient store failures
    /// within the deadline.
    async fn run_script(
        &self,
        req: &PurchaseRequest,
        activity: &Activity,
        per_user_limit: u32,
        order_id: &str,
        deadline_at: Instant,
    ) -> Result<ReserveOutcome, SeckillError> {
        let stock_key = keys::stock(&req.activity_id);
        let user_key = keys::user_limit(&req.user_id, &req.activity_id);
        let idem_key = req.idempotency_key.as_deref().map(keys::idempotency);
        let user_ttl_secs = self
            .cache
            .policy()
            .user_ttl(activity.end_time, Utc::now())
            .as_secs();

        let mut attempt = 0u32;
        loop {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SeckillError::DeadlineExceeded);
            }
            let request = ReserveRequest {
                stock_key: &stock_key,
                user_key: &user_key,
                quantity: req.quantity,
                per_user_limit,
                user_ttl_secs,
                order_id,
                idempotency: idem_key.as_deref().map(|key| IdempotencySpec {
                    key,
                    ttl_secs: self.config.idempotency_ttl.as_secs(),
                }),
            };
            match timeout(remaining, self.store.reserve(request)).await {
                Err(_) => return Err(SeckillError::DeadlineExceeded),
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(StoreError::Unavailable(msg))) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(SeckillError::StoreUnavailable(msg));
                    }
                    tracing::warn!(
                        target: "RESERVE",
                        attempt,
                        "reserve script transient failure, backing off: {msg}"
                    );
                    self.backoff(attempt, deadline_at).await;
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    /// Publish the event, retrying transient broker failures within the
    /// deadline.
    async fn dispatch(
        &self,
        event: &ReservationEvent,
        deadline_at: Instant,
    ) -> Result<(), SeckillError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let result = loop {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(SeckillError::DeadlineExceeded);
            }
            match timeout(remaining, self.dispatcher.publish(event)).await {
                Err(_) => break Err(SeckillError::DeadlineExceeded),
                Ok(Ok(())) => break Ok(()),
                Ok(Err(DispatchError::BrokerUnavailable(msg))) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        break Err(SeckillError::BrokerUnavailable(msg));
                    }
                    tracing::warn!(
                        target: "DISPATCH",
                        attempt,
                        order_id = %event.order_id,
                        "publish failed, backing off: {msg}"
                    );
                    self.backoff(attempt, deadline_at).await;
                }
                Ok(Err(err @ DispatchError::Rejected(_))) => break Err(err.into()),
            }
        };
        self.metrics.observe("dispatch", started.elapsed());
        result
    }

    /// Best-effort compensating rollback after a failed dispatch: restore
    /// the stock counter, take back the user counter, drop the recorded
    /// idempotent decision. A failure here is surfaced as a structured
    /// reconciliation marker for the consistency loop.
    async fn compensate(&self, req: &PurchaseRequest, activity: &Activity, event: &ReservationEvent) {
        let stock_key = keys::stock(&req.activity_id);
        let user_key = keys::user_limit(&req.user_id, &req.activity_id);

        let mut released = false;
        for attempt in 0..2 {
            match self
                .store
                .release(&stock_key, &user_key, req.quantity, activity.total_stock)
                .await
            {
                Ok(()) => {
                    released = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "RESERVE",
                        attempt,
                        order_id = %event.order_id,
                        "compensating release failed: {err}"
                    );
                    tokio::time::sleep(self.config.retry_base).await;
                }
            }
        }

        if let Some(raw_key) = req.idempotency_key.as_deref() {
            // The script recorded a success decision that no longer holds.
            let _ = self.store.del(&keys::idempotency(raw_key)).await;
        }

        if released {
            if let Ok(Some(stock)) = self.cache.get_stock(&req.activity_id).await {
                self.metrics.set_stock(&req.activity_id, stock);
                self.cache.propagate_stock(&req.activity_id, stock);
            }
            tracing::info!(
                target: "RESERVE",
                order_id = %event.order_id,
                state = ReservationState::RolledBack.as_str(),
                "reservation rolled back after dispatch failure"
            );
        } else {
            self.metrics.record_error();
            tracing::error!(
                target: "RECONCILER",
                key = %stock_key,
                user_key = %user_key,
                quantity = req.quantity,
                order_id = %event.order_id,
                "compensation failed; counters need reconciliation"
            );
        }
    }

    async fn backoff(&self, attempt: u32, deadline_at: Instant) {
        let exp = self.config.retry_base.saturating_mul(1 << attempt.min(10));
        let jitter = Duration::from_millis(
            rand::thread_rng().gen_range(0..=self.config.retry_base.as_millis() as u64),
        );
        let wait = (exp + jitter).min(deadline_at.saturating_duration_since(Instant::now()));
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlPolicy;
    use crate::dispatch::MemoryDispatcher;
    use crate::model::ActivityStatus;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    struct Harness {
        engine: ReservationEngine,
        store: Arc<MemoryStore>,
        dispatcher: Arc<MemoryDispatcher>,
        cache: Arc<CacheManager>,
    }

    async fn harness(total_stock: u32, per_user_limit: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let metrics = Arc::new(MetricsCollector::new());
        let cache = Arc::new(CacheManager::new(
            store.clone(),
            metrics.clone(),
            TtlPolicy {
                activity: Duration::from_secs(86_400),
                stock_override: Duration::ZERO,
                user_extra: Duration::from_secs(86_400),
            },
        ));

        let now = Utc::now();
        let activity = Activity {
            id: "act_1".to_string(),
            name: "Drop".to_string(),
            start_time: now - ChronoDuration::minutes(1),
            end_time: now + ChronoDuration::hours(1),
            status: ActivityStatus::Active,
            total_stock,
            seckill_price: Decimal::new(999, 2),
            original_price: Decimal::new(19_900, 2),
            per_user_limit,
        };
        cache.set_activity(&activity).await.unwrap();
        cache
            .seed_stock("act_1", i64::from(total_stock), activity.end_time)
            .await
            .unwrap();

        let engine = ReservationEngine::new(
            store.clone(),
            dispatcher.clone(),
            cache.clone(),
            metrics,
            ReservationConfig {
                retry_base: Duration::from_millis(5),
                ..ReservationConfig::default()
            },
        );
        Harness {
            engine,
            store,
            dispatcher,
            cache,
        }
    }

    fn request(user: &str, quantity: u32) -> PurchaseRequest {
        PurchaseRequest {
            activity_id: "act_1".to_string(),
            user_id: user.to_string(),
            quantity,
            user_limit: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_success_decrements_and_dispatches() {
        let h = harness(5, 2).await;
        let receipt = h.engine.reserve(&request("u1", 1)).await.unwrap();
        assert_eq!(receipt.remaining_stock, 4);
        assert_eq!(receipt.user_purchased, 1);
        assert!(!receipt.replayed);

        let events = h.dispatcher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_id, receipt.order_id);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(h.cache.get_stock("act_1").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_user_limit_enforced_in_sequence() {
        let h = harness(10, 2).await;
        assert!(h.engine.reserve(&request("u1", 1)).await.is_ok());
        assert!(h.engine.reserve(&request("u1", 1)).await.is_ok());
        assert_eq!(
            h.engine.reserve(&request("u1", 1)).await,
            Err(SeckillError::UserLimitExceeded { purchased: 2 })
        );
        assert_eq!(
            h.cache.get_user_purchased("u1", "act_1").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_request_cannot_raise_activity_limit() {
        let h = harness(10, 1).await;
        let mut req = request("u1", 1);
        req.user_limit = Some(5);
        assert!(h.engine.reserve(&req).await.is_ok());
        assert_eq!(
            h.engine.reserve(&req).await,
            Err(SeckillError::UserLimitExceeded { purchased: 1 })
        );
    }

    #[tokio::test]
    async fn test_dispatch_failure_rolls_back() {
        let h = harness(5, 2).await;
        h.dispatcher.set_failing(true);

        let err = h.engine.reserve(&request("u1", 1)).await.unwrap_err();
        assert!(matches!(err, SeckillError::BrokerUnavailable(_)));

        // Stock restored, user counter back to zero, nothing dispatched.
        assert_eq!(h.cache.get_stock("act_1").await.unwrap(), Some(5));
        assert_eq!(h.cache.get_user_purchased("u1", "act_1").await.unwrap(), 0);
        assert_eq!(h.dispatcher.event_count(), 0);
    }

    #[tokio::test]
    async fn test_idempotent_replay_same_order_id() {
        let h = harness(5, 3).await;
        let mut req = request("u1", 1);
        req.idempotency_key = Some("client-key-1".to_string());

        let first = h.engine.reserve(&req).await.unwrap();
        let second = h.engine.reserve(&req).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert!(second.replayed);
        // One decrement, one dispatched event.
        assert_eq!(h.cache.get_stock("act_1").await.unwrap(), Some(4));
        assert_eq!(h.dispatcher.event_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_clears_idempotency_record() {
        let h = harness(5, 3).await;
        h.dispatcher.set_failing(true);
        let mut req = request("u1", 1);
        req.idempotency_key = Some("client-key-2".to_string());
        assert!(h.engine.reserve(&req).await.is_err());

        // After compensation the client may retry and win for real.
        h.dispatcher.set_failing(false);
        let receipt = h.engine.reserve(&req).await.unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.remaining_stock, 4);
        assert_eq!(h.dispatcher.event_count(), 1);
    }

    #[tokio::test]
    async fn test_success_propagates_stock_to_source() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let metrics = Arc::new(MetricsCollector::new());
        let source = Arc::new(crate::source::MemorySource::new());
        let queue = Arc::new(crate::cache::WriteBehindQueue::new(
            8,
            source.clone(),
            metrics.clone(),
        ));
        let cache = Arc::new(
            CacheManager::new(
                store.clone(),
                metrics.clone(),
                TtlPolicy {
                    activity: Duration::from_secs(86_400),
                    stock_override: Duration::ZERO,
                    user_extra: Duration::from_secs(86_400),
                },
            )
            .with_write_behind(queue.clone()),
        );

        let now = Utc::now();
        let activity = Activity {
            id: "act_1".to_string(),
            name: "Drop".to_string(),
            start_time: now - ChronoDuration::minutes(1),
            end_time: now + ChronoDuration::hours(1),
            status: ActivityStatus::Active,
            total_stock: 5,
            seckill_price: Decimal::new(999, 2),
            original_price: Decimal::new(19_900, 2),
            per_user_limit: 2,
        };
        cache.set_activity(&activity).await.unwrap();
        cache.seed_stock("act_1", 5, activity.end_time).await.unwrap();

        let engine = ReservationEngine::new(
            store,
            dispatcher,
            cache,
            metrics,
            ReservationConfig::default(),
        );
        engine.reserve(&request("u1", 1)).await.unwrap();

        // Seed parked "5", the reservation parked "4"; the drain applies
        // them in order, leaving the source at the post-reservation value.
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.drain_once(10).await, 2);
        assert_eq!(
            source.get(&crate::cache::keys::stock("act_1")).as_deref(),
            Some("4")
        );
    }

    #[tokio::test]
    async fn test_single_item_race() {
        let h = harness(1, 1).await;
        let engine = Arc::new(h.engine);

        let a = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.reserve(&request("u1", 1)).await })
        };
        let b = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.reserve(&request("u2", 1)).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(winners.len(), 1);
        if let Ok(receipt) = winners[0] {
            assert_eq!(receipt.remaining_stock, 0);
        }
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        assert!(matches!(loser, Err(SeckillError::OutOfStock { .. })));
        assert_eq!(h.cache.get_stock("act_1").await.unwrap(), Some(0));
        assert_eq!(h.dispatcher.event_count(), 1);
    }
}
