//! In-process hot store backend.
//!
//! A single mutex over the key space mirrors the server's serial script
//! execution, so the reservation contract (one mutator at a time, no torn
//! multi-key updates) holds exactly as it does against the real store. Used
//! by the test suite; never on a production hot path.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::{HotStore, KeyTtl, ReserveOutcome, ReserveRequest, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<FxHashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Entry>> {
        // Lock poisoning only happens if a holder panicked; the map is still
        // coherent for these single-step operations.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn live_value<'a>(map: &'a FxHashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a str> {
    map.get(key)
        .filter(|e| e.live(now))
        .map(|e| e.value.as_str())
}

fn counter_value(
    map: &FxHashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Result<i64, StoreError> {
    match live_value(map, key, now) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| StoreError::WrongType(key.to_string())),
    }
}

fn put_counter(map: &mut FxHashMap<String, Entry>, key: &str, value: i64, now: Instant) {
    // Preserve an existing live TTL, like SET ... KEEPTTL.
    let expires_at = map.get(key).filter(|e| e.live(now)).and_then(|e| e.expires_at);
    map.insert(
        key.to_string(),
        Entry {
            value: value.to_string(),
            expires_at,
        },
    );
}

#[async_trait]
impl HotStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let map = self.lock();
        Ok(live_value(&map, key, now).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut map = self.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut map = self.lock();
        Ok(map.remove(key).is_some_and(|e| e.live(now)))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut map = self.lock();
        let next = counter_value(&map, key, now)? + delta;
        put_counter(&mut map, key, next, now);
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        let map = self.lock();
        Ok(match map.get(key).filter(|e| e.live(now)) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn reserve(&self, req: ReserveRequest<'_>) -> Result<ReserveOutcome, StoreError> {
        let now = Instant::now();
        let mut map = self.lock();

        if let Some(ref idem) = req.idempotency {
            if let Some(prior) = live_value(&map, idem.key, now) {
                return serde_json::from_str(prior)
                    .map_err(|_| StoreError::WrongType(idem.key.to_string()));
            }
        }

        let Some(stock_raw) = live_value(&map, req.stock_key, now) else {
            return Ok(ReserveOutcome::Inactive);
        };
        let stock: i64 = stock_raw
            .parse()
            .map_err(|_| StoreError::WrongType(req.stock_key.to_string()))?;

        let qty = i64::from(req.quantity);
        if stock < qty {
            return Ok(ReserveOutcome::InsufficientStock {
                remaining_stock: stock,
            });
        }

        let purchased = counter_value(&map, req.user_key, now)?;
        if purchased + qty > i64::from(req.per_user_limit) {
            return Ok(ReserveOutcome::ExceedsUserLimit {
                user_purchased: purchased,
            });
        }

        let remaining = stock - qty;
        put_counter(&mut map, req.stock_key, remaining, now);
        let total = purchased + qty;
        put_counter(&mut map, req.user_key, total, now);
        if req.user_ttl_secs > 0 {
            if let Some(entry) = map.get_mut(req.user_key) {
                entry.expires_at = Some(now + Duration::from_secs(req.user_ttl_secs));
            }
        }

        let outcome = ReserveOutcome::Ok {
            remaining_stock: remaining,
            user_purchased: total,
            order_id: req.order_id.to_string(),
        };

        if let Some(ref idem) = req.idempotency {
            let decision = serde_json::to_string(&outcome)
                .map_err(|e| StoreError::WrongType(e.to_string()))?;
            map.insert(
                idem.key.to_string(),
                Entry {
                    value: decision,
                    expires_at: Some(now + Duration::from_secs(idem.ttl_secs.max(1))),
                },
            );
        }

        Ok(outcome)
    }

    async fn release(
        &self,
        stock_key: &str,
        user_key: &str,
        quantity: u32,
        stock_cap: u32,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut map = self.lock();

        let qty = i64::from(quantity);
        let mut stock = counter_value(&map, stock_key, now)? + qty;
        if stock_cap > 0 {
            stock = stock.min(i64::from(stock_cap));
        }
        put_counter(&mut map, stock_key, stock, now);

        let purchased = counter_value(&map, user_key, now)?;
        if purchased > 0 {
            put_counter(&mut map, user_key, (purchased - qty).max(0), now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::IdempotencySpec;
    use super::*;

    #[tokio::test]
    async fn test_counter_round_trip_and_ttl() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("k", 5).await.unwrap(), 5);
        assert_eq!(store.incr_by("k", -2).await.unwrap(), 3);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(store.ttl("absent").await.unwrap(), KeyTtl::Missing);

        store
            .set("e", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("e").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_is_wrong_type() {
        let store = MemoryStore::new();
        store.set("s", "hello", None).await.unwrap();
        assert!(matches!(
            store.incr_by("s", 1).await,
            Err(StoreError::WrongType(_))
        ));
    }

    fn reserve_req<'a>(qty: u32, limit: u32, order_id: &'a str) -> ReserveRequest<'a> {
        ReserveRequest {
            stock_key: "stock",
            user_key: "user",
            quantity: qty,
            per_user_limit: limit,
            user_ttl_secs: 0,
            order_id,
            idempotency: None,
        }
    }

    #[tokio::test]
    async fn test_reserve_decrements_both_counters() {
        let store = MemoryStore::new();
        store.set("stock", "5", None).await.unwrap();

        let outcome = store.reserve(reserve_req(2, 3, "o-1")).await.unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::Ok {
                remaining_stock: 3,
                user_purchased: 2,
                order_id: "o-1".to_string()
            }
        );
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("user").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_reserve_rejections_leave_counters_untouched() {
        let store = MemoryStore::new();

        // Missing stock key: inactive
        assert_eq!(
            store.reserve(reserve_req(1, 3, "o-1")).await.unwrap(),
            ReserveOutcome::Inactive
        );

        store.set("stock", "1", None).await.unwrap();
        assert_eq!(
            store.reserve(reserve_req(2, 3, "o-2")).await.unwrap(),
            ReserveOutcome::InsufficientStock { remaining_stock: 1 }
        );
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("1"));

        store.set("stock", "10", None).await.unwrap();
        store.set("user", "3", None).await.unwrap();
        assert_eq!(
            store.reserve(reserve_req(1, 3, "o-3")).await.unwrap(),
            ReserveOutcome::ExceedsUserLimit { user_purchased: 3 }
        );
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_recorded_decision() {
        let store = MemoryStore::new();
        store.set("stock", "5", None).await.unwrap();

        let mut req = reserve_req(1, 3, "o-first");
        req.idempotency = Some(IdempotencySpec {
            key: "idem:abc",
            ttl_secs: 60,
        });
        let first = store.reserve(req.clone()).await.unwrap();

        // Replay with a different candidate order id: the recorded decision
        // wins and the counters do not move again.
        let mut replay = reserve_req(1, 3, "o-second");
        replay.idempotency = Some(IdempotencySpec {
            key: "idem:abc",
            ttl_secs: 60,
        });
        let second = store.reserve(replay).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_release_restores_and_caps() {
        let store = MemoryStore::new();
        store.set("stock", "3", None).await.unwrap();
        store.set("user", "2", None).await.unwrap();

        store.release("stock", "user", 2, 4).await.unwrap();
        // 3 + 2 capped at 4
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("4"));
        assert_eq!(store.get("user").await.unwrap().as_deref(), Some("0"));

        // Releasing more than purchased floors the user counter at zero.
        store.release("stock", "user", 2, 0).await.unwrap();
        assert_eq!(store.get("user").await.unwrap().as_deref(), Some("0"));
    }
}
