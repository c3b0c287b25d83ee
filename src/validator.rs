//! Activity validation: the ordered state-machine check in front of the
//! reservation script.
//!
//! Check order is fixed — exists, status, window, stock — and the first
//! failure short-circuits. A passing result hands the Activity snapshot to
//! the caller so downstream stages never re-read it.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cache::CacheManager;
use crate::error::SeckillError;
use crate::model::{Activity, ActivityStatus};

/// Pure snapshot check; deterministic given the same activity and clock.
pub fn check_snapshot(activity: &Activity, now: DateTime<Utc>) -> Result<(), SeckillError> {
    if activity.status != ActivityStatus::Active {
        return Err(SeckillError::NotActive);
    }
    if now < activity.start_time {
        return Err(SeckillError::NotStarted);
    }
    if now > activity.end_time {
        return Err(SeckillError::Ended);
    }
    Ok(())
}

pub struct ActivityValidator {
    cache: Arc<CacheManager>,
}

impl ActivityValidator {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    /// Full validation for a purchase attempt.
    ///
    /// A cache miss falls through to the system of record once (read-through)
    /// before deciding the activity does not exist.
    pub async fn validate(&self, activity_id: &str) -> Result<Activity, SeckillError> {
        let activity = match self.cache.get_activity(activity_id).await? {
            Some(activity) => activity,
            None => self
                .cache
                .refresh_activity(activity_id)
                .await?
                .ok_or_else(|| SeckillError::NotFound(activity_id.to_string()))?,
        };

        check_snapshot(&activity, Utc::now())?;

        let remaining = self.cache.get_stock(activity_id).await?.unwrap_or(0);
        if remaining <= 0 {
            return Err(SeckillError::OutOfStock { remaining: 0 });
        }

        Ok(activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn activity(status: ActivityStatus, start_offset_secs: i64, end_offset_secs: i64) -> Activity {
        let now = Utc::now();
        Activity {
            id: "act_1".to_string(),
            name: "Drop".to_string(),
            start_time: now + ChronoDuration::seconds(start_offset_secs),
            end_time: now + ChronoDuration::seconds(end_offset_secs),
            status,
            total_stock: 10,
            seckill_price: Decimal::new(999, 2),
            original_price: Decimal::new(19_900, 2),
            per_user_limit: 2,
        }
    }

    #[test]
    fn test_check_order_status_before_window() {
        // A pending activity whose window has not opened reports NotActive,
        // not NotStarted: status is checked first.
        let act = activity(ActivityStatus::Pending, 10, 3600);
        assert_eq!(
            check_snapshot(&act, Utc::now()),
            Err(SeckillError::NotActive)
        );
    }

    #[test]
    fn test_check_window_edges() {
        let act = activity(ActivityStatus::Active, 10, 3600);
        assert_eq!(
            check_snapshot(&act, Utc::now()),
            Err(SeckillError::NotStarted)
        );
        assert_eq!(check_snapshot(&act, act.start_time), Ok(()));
        assert_eq!(check_snapshot(&act, act.end_time), Ok(()));
        assert_eq!(
            check_snapshot(&act, act.end_time + ChronoDuration::seconds(1)),
            Err(SeckillError::Ended)
        );
    }

    async fn validator_with(
        activity: &Activity,
        stock: Option<i64>,
    ) -> (ActivityValidator, Arc<CacheManager>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheManager::new(
            store,
            Arc::new(MetricsCollector::new()),
            crate::cache::TtlPolicy {
                activity: Duration::from_secs(86_400),
                stock_override: Duration::ZERO,
                user_extra: Duration::from_secs(86_400),
            },
        ));
        cache.set_activity(activity).await.unwrap();
        if let Some(stock) = stock {
            cache
                .seed_stock(&activity.id, stock, activity.end_time)
                .await
                .unwrap();
        }
        (ActivityValidator::new(cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_validate_passes_with_snapshot() {
        let act = activity(ActivityStatus::Active, -10, 3600);
        let (validator, _) = validator_with(&act, Some(5)).await;
        let snapshot = validator.validate("act_1").await.unwrap();
        assert_eq!(snapshot, act);
    }

    #[tokio::test]
    async fn test_validate_unknown_activity() {
        let act = activity(ActivityStatus::Active, -10, 3600);
        let (validator, _) = validator_with(&act, Some(5)).await;
        assert_eq!(
            validator.validate("nope").await,
            Err(SeckillError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_validate_out_of_stock() {
        let act = activity(ActivityStatus::Active, -10, 3600);
        let (validator, _) = validator_with(&act, Some(0)).await;
        assert_eq!(
            validator.validate("act_1").await,
            Err(SeckillError::OutOfStock { remaining: 0 })
        );

        // Missing stock counter counts as no stock, not as a server error.
        let (validator, _) = validator_with(&act, None).await;
        assert_eq!(
            validator.validate("act_1").await,
            Err(SeckillError::OutOfStock { remaining: 0 })
        );
    }
}
