//! Typed cache access over the hot store.
//!
//! One manager, three value families with distinct prefixes and TTL
//! policies: activity snapshots (24h), stock counters (activity-bounded),
//! user purchase counters (activity end + 24h). Reads and writes record
//! into the metrics collector; reads can trigger refresh-ahead when the
//! remaining TTL drops under a threshold ratio.

pub mod keys;
mod write_behind;

pub use write_behind::{PendingWrite, WriteBehindQueue};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::metrics::MetricsCollector;
use crate::model::Activity;
use crate::source::{DataLoader, SourceError, SourceWriter};
use crate::store::{HotStore, KeyTtl, StoreError};

/// Remaining-TTL ratio under which a read schedules a background reload.
const REFRESH_AHEAD_RATIO: f64 = 0.2;

#[derive(Error, Debug)]
pub enum CacheWriteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Write-through only: the hot store accepted the value but the system
    /// of record did not.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// TTL policy per value family. `stock_override` of zero means
/// activity-bounded (expire when the window closes).
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub activity: Duration,
    pub stock_override: Duration,
    pub user_extra: Duration,
}

impl TtlPolicy {
    pub fn stock_ttl(&self, activity_end: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        if !self.stock_override.is_zero() {
            return self.stock_override;
        }
        (activity_end - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
    }

    pub fn user_ttl(&self, activity_end: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let bounded = (activity_end - now).to_std().unwrap_or(Duration::ZERO);
        bounded + self.user_extra
    }
}

pub struct CacheManager {
    store: Arc<dyn HotStore>,
    metrics: Arc<MetricsCollector>,
    policy: TtlPolicy,
    loader: Option<Arc<dyn DataLoader>>,
    source: Option<Arc<dyn SourceWriter>>,
    write_behind: Option<Arc<WriteBehindQueue>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn HotStore>, metrics: Arc<MetricsCollector>, policy: TtlPolicy) -> Self {
        Self {
            store,
            metrics,
            policy,
            loader: None,
            source: None,
            write_behind: None,
        }
    }

    /// Register the system-of-record loader used by refresh-ahead and
    /// read-through fallbacks.
    pub fn with_loader(mut self, loader: Arc<dyn DataLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Register the synchronous system-of-record writer (write-through).
    pub fn with_source_writer(mut self, source: Arc<dyn SourceWriter>) -> Self {
        self.source = Some(source);
        self
    }

    /// Register the asynchronous drain queue (write-behind).
    pub fn with_write_behind(mut self, queue: Arc<WriteBehindQueue>) -> Self {
        self.write_behind = Some(queue);
        self
    }

    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn HotStore> {
        &self.store
    }

    // ========================================================================
    // Activity snapshots
    // ========================================================================

    pub async fn get_activity(&self, activity_id: &str) -> Result<Option<Activity>, StoreError> {
        let key = keys::activity(activity_id);
        match self.store.get(&key).await? {
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
            Some(raw) => {
                self.metrics.record_hit();
                let activity: Activity = serde_json::from_str(&raw).map_err(|e| {
                    self.metrics.record_error();
                    StoreError::WrongType(format!("{key}: {e}"))
                })?;
                self.maybe_refresh_ahead(&key, self.policy.activity);
                Ok(Some(activity))
            }
        }
    }

    pub async fn set_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let raw = serde_json::to_string(activity)
            .map_err(|e| StoreError::WrongType(e.to_string()))?;
        self.store
            .set(&keys::activity(&activity.id), &raw, Some(self.policy.activity))
            .await?;
        self.metrics.record_set();
        Ok(())
    }

    pub async fn invalidate_activity(&self, activity_id: &str) -> Result<bool, StoreError> {
        let removed = self.store.del(&keys::activity(activity_id)).await?;
        self.metrics.record_delete();
        Ok(removed)
    }

    /// Synchronous reload from the system of record, rewriting the cache
    /// entry. Returns the fresh activity when the source has one.
    pub async fn refresh_activity(&self, activity_id: &str) -> Result<Option<Activity>, StoreError> {
        let Some(loader) = self.loader.clone() else {
            return Ok(None);
        };
        let key = keys::activity(activity_id);
        match loader.load_from_source(&key).await {
            Ok(Some(raw)) => {
                let activity: Activity = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::WrongType(format!("{key}: {e}")))?;
                self.store
                    .set(&key, &raw, Some(self.policy.activity))
                    .await?;
                self.metrics.record_set();
                Ok(Some(activity))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.metrics.record_error();
                Err(StoreError::Unavailable(err.to_string()))
            }
        }
    }

    // ========================================================================
    // Stock counters
    // ========================================================================

    pub async fn get_stock(&self, activity_id: &str) -> Result<Option<i64>, StoreError> {
        let key = keys::stock(activity_id);
        match self.store.get(&key).await? {
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
            Some(raw) => {
                self.metrics.record_hit();
                let stock = raw
                    .parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key))?;
                self.metrics.set_stock(activity_id, stock);
                Ok(Some(stock))
            }
        }
    }

    /// Seed (or warm) the live stock counter for an activity window.
    ///
    /// Write-behind: the hot store is current immediately, the system of
    /// record catches up through the drain queue.
    pub async fn seed_stock(
        &self,
        activity_id: &str,
        stock: i64,
        activity_end: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ttl = self.policy.stock_ttl(activity_end, Utc::now());
        self.write_behind(&keys::stock(activity_id), &stock.to_string(), Some(ttl))
            .await?;
        self.metrics.set_stock(activity_id, stock);
        Ok(())
    }

    /// Administrative stock reset. Write-through when a source writer is
    /// registered, so the call only succeeds once the reset provably
    /// reached the system of record; write-behind otherwise.
    pub async fn reset_stock(
        &self,
        activity_id: &str,
        stock: i64,
        activity_end: DateTime<Utc>,
    ) -> Result<(), CacheWriteError> {
        let key = keys::stock(activity_id);
        let value = stock.to_string();
        let ttl = Some(self.policy.stock_ttl(activity_end, Utc::now()));
        if self.source.is_some() {
            self.write_through(&key, &value, ttl).await?;
        } else {
            self.write_behind(&key, &value, ttl).await?;
        }
        self.metrics.set_stock(activity_id, stock);
        Ok(())
    }

    /// Asynchronous stock propagation after a reservation script ran. The
    /// hot-store counter is already current (the script is its only
    /// mutator), so only the drain half of the write-behind strategy
    /// applies: park the new value for the system of record.
    pub fn propagate_stock(&self, activity_id: &str, stock: i64) {
        if let Some(queue) = &self.write_behind {
            queue.enqueue(PendingWrite {
                key: keys::stock(activity_id),
                value: stock.to_string(),
            });
        }
    }

    // ========================================================================
    // User purchase counters
    // ========================================================================

    pub async fn get_user_purchased(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<i64, StoreError> {
        let key = keys::user_limit(user_id, activity_id);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::WrongType(key)),
        }
    }

    // ========================================================================
    // Write strategies
    // ========================================================================

    /// Write-through: the call succeeds only when both the hot store and the
    /// system of record accepted the value.
    pub async fn write_through(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheWriteError> {
        self.store.set(key, value, ttl).await?;
        self.metrics.record_set();
        if let Some(source) = &self.source {
            source.persist(key, value).await?;
        }
        Ok(())
    }

    /// Write-behind: hot store synchronously, system of record via the
    /// bounded drain queue. Queue overflow drops the source write (counted)
    /// but the call still succeeds.
    pub async fn write_behind(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.store.set(key, value, ttl).await?;
        self.metrics.record_set();
        if let Some(queue) = &self.write_behind {
            queue.enqueue(PendingWrite {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }

    /// Refresh-ahead: when the remaining TTL is below the threshold ratio,
    /// reload the entry from the source in the background. The current value
    /// is returned to the caller either way.
    fn maybe_refresh_ahead(&self, key: &str, configured_ttl: Duration) {
        let Some(loader) = self.loader.clone() else { return };
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let key = key.to_string();
        tokio::spawn(async move {
            let remaining = match store.ttl(&key).await {
                Ok(KeyTtl::Expires(remaining)) => remaining,
                _ => return,
            };
            if remaining.as_secs_f64() >= configured_ttl.as_secs_f64() * REFRESH_AHEAD_RATIO {
                return;
            }
            match loader.load_from_source(&key).await {
                Ok(Some(fresh)) => {
                    if let Err(err) = store.set(&key, &fresh, Some(configured_ttl)).await {
                        tracing::warn!(target: "CACHE", key = %key, "refresh-ahead rewrite failed: {err}");
                    } else {
                        metrics.record_set();
                        tracing::debug!(target: "CACHE", key = %key, "refresh-ahead reloaded entry");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    metrics.record_error();
                    tracing::warn!(target: "CACHE", key = %key, "refresh-ahead load failed: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityStatus;
    use crate::source::MemorySource;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn policy() -> TtlPolicy {
        TtlPolicy {
            activity: Duration::from_secs(86_400),
            stock_override: Duration::ZERO,
            user_extra: Duration::from_secs(86_400),
        }
    }

    fn activity(id: &str) -> Activity {
        Activity {
            id: id.to_string(),
            name: "Drop".to_string(),
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap(),
            status: ActivityStatus::Active,
            total_stock: 100,
            seckill_price: Decimal::new(999, 2),
            original_price: Decimal::new(19_900, 2),
            per_user_limit: 2,
        }
    }

    fn manager(store: Arc<MemoryStore>) -> CacheManager {
        CacheManager::new(store, Arc::new(MetricsCollector::new()), policy())
    }

    #[tokio::test]
    async fn test_activity_round_trip_and_invalidate() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager(store);
        let act = activity("a1");

        assert_eq!(cache.get_activity("a1").await.unwrap(), None);
        cache.set_activity(&act).await.unwrap();
        assert_eq!(cache.get_activity("a1").await.unwrap(), Some(act));
        assert!(cache.invalidate_activity("a1").await.unwrap());
        assert_eq!(cache.get_activity("a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stock_and_user_counters() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager(store.clone());
        let end = Utc::now() + chrono::Duration::hours(1);

        cache.seed_stock("a1", 300, end).await.unwrap();
        assert_eq!(cache.get_stock("a1").await.unwrap(), Some(300));
        assert_eq!(cache.get_user_purchased("u1", "a1").await.unwrap(), 0);

        store
            .incr_by(&keys::user_limit("u1", "a1"), 2)
            .await
            .unwrap();
        assert_eq!(cache.get_user_purchased("u1", "a1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_through_requires_source_success() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let cache = manager(store.clone()).with_source_writer(source.clone());

        cache.write_through("k", "v", None).await.unwrap();
        assert_eq!(source.get("k").as_deref(), Some("v"));

        source.set_failing(true);
        let err = cache.write_through("k2", "v2", None).await.unwrap_err();
        assert!(matches!(err, CacheWriteError::Source(_)));
        // Hot store write happened before the source refusal.
        assert_eq!(store.get("k2").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_write_behind_survives_source_outage() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let metrics = Arc::new(MetricsCollector::new());
        let queue = Arc::new(WriteBehindQueue::new(8, source.clone(), metrics.clone()));
        let cache = CacheManager::new(store, metrics, policy()).with_write_behind(queue.clone());

        cache.write_behind("k", "v", None).await.unwrap();
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.drain_once(10).await, 1);
        assert_eq!(source.get("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_seed_stock_parks_source_write() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let metrics = Arc::new(MetricsCollector::new());
        let queue = Arc::new(WriteBehindQueue::new(8, source.clone(), metrics.clone()));
        let cache =
            CacheManager::new(store, metrics, policy()).with_write_behind(queue.clone());
        let end = Utc::now() + chrono::Duration::hours(1);

        cache.seed_stock("a1", 300, end).await.unwrap();
        assert_eq!(cache.get_stock("a1").await.unwrap(), Some(300));
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.drain_once(10).await, 1);
        assert_eq!(source.get(&keys::stock("a1")).as_deref(), Some("300"));
    }

    #[tokio::test]
    async fn test_reset_stock_writes_through_to_source() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let cache = manager(store.clone()).with_source_writer(source.clone());
        let end = Utc::now() + chrono::Duration::hours(1);

        // No drain task involved: the reset is in the source on return.
        cache.reset_stock("a1", 42, end).await.unwrap();
        assert_eq!(cache.get_stock("a1").await.unwrap(), Some(42));
        assert_eq!(source.get(&keys::stock("a1")).as_deref(), Some("42"));

        source.set_failing(true);
        let err = cache.reset_stock("a1", 7, end).await.unwrap_err();
        assert!(matches!(err, CacheWriteError::Source(_)));
    }

    #[tokio::test]
    async fn test_propagate_stock_enqueues_only() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let metrics = Arc::new(MetricsCollector::new());
        let queue = Arc::new(WriteBehindQueue::new(8, source.clone(), metrics.clone()));
        let cache = CacheManager::new(store.clone(), metrics, policy())
            .with_write_behind(queue.clone());

        // Counter mutated by a script; propagation must not rewrite it.
        store.set(&keys::stock("a1"), "4", None).await.unwrap();
        cache.propagate_stock("a1", 4);
        assert_eq!(store.get(&keys::stock("a1")).await.unwrap().as_deref(), Some("4"));
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.drain_once(10).await, 1);
        assert_eq!(source.get(&keys::stock("a1")).as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_refresh_ahead_rewrites_near_expiry_entry() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        let cache = CacheManager::new(
            store.clone(),
            Arc::new(MetricsCollector::new()),
            TtlPolicy {
                activity: Duration::from_secs(10),
                stock_override: Duration::ZERO,
                user_extra: Duration::ZERO,
            },
        )
        .with_loader(source.clone());

        let act = activity("a1");
        let raw = serde_json::to_string(&act).unwrap();
        let key = keys::activity("a1");
        source.insert(&key, &raw);
        // Entry with 1s left out of a 10s policy: under the 20% threshold.
        store.set(&key, &raw, Some(Duration::from_secs(1))).await.unwrap();

        assert!(cache.get_activity("a1").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Background reload re-applied the full TTL.
        match store.ttl(&key).await.unwrap() {
            KeyTtl::Expires(remaining) => assert!(remaining > Duration::from_secs(5)),
            other => panic!("expected refreshed TTL, got {other:?}"),
        }
    }
}
