//! Hot store client: typed interface over the key/value server that owns
//! stock and per-user counters during an active window.
//!
//! The trait exposes the plain single-key operations plus the two atomic
//! multi-key script operations (`reserve` / `release`). The scripts are the
//! only mutators of the stock and user-counter keys on the hot path; that
//! serial execution is the sole guarantee against overselling.
//!
//! Two backends:
//! - [`RedisStore`]: production backend, scripts run server-side as Lua.
//! - [`MemoryStore`]: in-process backend with the same atomicity contract,
//!   used by the test suite.

mod memory;
mod redis;
pub mod scripts;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transport-level failure; retryable within the request deadline.
    #[error("hot store unavailable: {0}")]
    Unavailable(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("wrong value type for key: {0}")]
    WrongType(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// TTL state of a key, distinguishing "no key" from "no expiry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Arguments for the atomic reservation script.
#[derive(Debug, Clone)]
pub struct ReserveRequest<'a> {
    pub stock_key: &'a str,
    pub user_key: &'a str,
    pub quantity: u32,
    pub per_user_limit: u32,
    /// TTL applied to the user counter on first write (0 = none).
    pub user_ttl_secs: u64,
    /// Server-assigned order id, recorded in the idempotency record.
    pub order_id: &'a str,
    /// Optional idempotency record; when present, a replay returns the
    /// originally recorded decision instead of re-executing.
    pub idempotency: Option<IdempotencySpec<'a>>,
}

#[derive(Debug, Clone)]
pub struct IdempotencySpec<'a> {
    pub key: &'a str,
    pub ttl_secs: u64,
}

/// Decision returned by the reservation script.
///
/// Serialized form is shared between the Lua script (cjson) and the memory
/// backend, so both produce identical outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReserveOutcome {
    Ok {
        remaining_stock: i64,
        user_purchased: i64,
        order_id: String,
    },
    InsufficientStock {
        remaining_stock: i64,
    },
    ExceedsUserLimit {
        user_purchased: i64,
    },
    /// Stock key absent: the activity was never seeded or has been torn down.
    Inactive,
}

#[async_trait]
pub trait HotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Returns true when the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomic counter increment (negative delta decrements). Creates the key
    /// at 0 when absent. Fails with `WrongType` on non-integer values.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Atomic reservation decision over the stock and user-counter keys.
    async fn reserve(&self, req: ReserveRequest<'_>) -> Result<ReserveOutcome, StoreError>;

    /// Compensating action: restore `quantity` to the stock counter (capped
    /// at `stock_cap` when > 0) and take it back from the user counter
    /// (floored at 0). Atomic with respect to `reserve`.
    async fn release(
        &self,
        stock_key: &str,
        user_key: &str,
        quantity: u32,
        stock_cap: u32,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_outcome_wire_format() {
        // The Lua script emits exactly these shapes via cjson; a drift here
        // breaks the redis backend silently.
        let ok: ReserveOutcome = serde_json::from_str(
            r#"{"status":"ok","remaining_stock":4,"user_purchased":1,"order_id":"o-1"}"#,
        )
        .unwrap();
        assert_eq!(
            ok,
            ReserveOutcome::Ok {
                remaining_stock: 4,
                user_purchased: 1,
                order_id: "o-1".to_string()
            }
        );

        let short: ReserveOutcome =
            serde_json::from_str(r#"{"status":"insufficient_stock","remaining_stock":0}"#).unwrap();
        assert_eq!(short, ReserveOutcome::InsufficientStock { remaining_stock: 0 });

        let capped: ReserveOutcome =
            serde_json::from_str(r#"{"status":"exceeds_user_limit","user_purchased":2}"#).unwrap();
        assert_eq!(capped, ReserveOutcome::ExceedsUserLimit { user_purchased: 2 });

        let inactive: ReserveOutcome = serde_json::from_str(r#"{"status":"inactive"}"#).unwrap();
        assert_eq!(inactive, ReserveOutcome::Inactive);
    }
}
