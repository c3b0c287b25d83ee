//! Redis-backed hot store.
//!
//! A small fixed pool of multiplexed connections (`ConnectionManager`
//! re-establishes transport on failure) with the reservation scripts loaded
//! as `redis::Script` so EVALSHA is used after first invocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};

use super::scripts;
use super::{HotStore, KeyTtl, ReserveOutcome, ReserveRequest, StoreError};

pub struct RedisStore {
    pool: Vec<ConnectionManager>,
    next: AtomicUsize,
    reserve: Script,
    reserve_idempotent: Script,
    release: Script,
}

impl RedisStore {
    /// Connect `pool_size` multiplexed connections to the given URL.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            pool.push(
                ConnectionManager::new(client.clone())
                    .await
                    .map_err(map_err)?,
            );
        }
        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
            reserve: Script::new(scripts::RESERVE),
            reserve_idempotent: Script::new(scripts::RESERVE_IDEMPOTENT),
            release: Script::new(scripts::RELEASE),
        })
    }

    /// Round-robin over the pool; each handle is a cheap clone.
    fn conn(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }

    /// Raw script execution for callers outside the typed surface.
    pub async fn eval(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[&str],
    ) -> Result<redis::Value, StoreError> {
        let mut conn = self.conn();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        invocation.invoke_async(&mut conn).await.map_err(map_err)
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::TypeError {
        StoreError::WrongType(err.to_string())
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

fn parse_outcome(raw: &str) -> Result<ReserveOutcome, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::WrongType(format!("reserve script reply {raw:?}: {e}")))
}

#[async_trait]
impl HotStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(map_err),
            None => conn.set(key, value).await.map_err(map_err),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        conn.incr(key, delta).await.map_err(map_err)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut conn = self.conn();
        let secs: i64 = conn.ttl(key).await.map_err(map_err)?;
        Ok(match secs {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            s => KeyTtl::Expires(Duration::from_secs(s.max(0) as u64)),
        })
    }

    async fn reserve(&self, req: ReserveRequest<'_>) -> Result<ReserveOutcome, StoreError> {
        let mut conn = self.conn();
        let raw: String = match req.idempotency {
            Some(ref idem) => self
                .reserve_idempotent
                .key(req.stock_key)
                .key(req.user_key)
                .key(idem.key)
                .arg(req.quantity)
                .arg(req.per_user_limit)
                .arg(req.user_ttl_secs)
                .arg(req.order_id)
                .arg(idem.ttl_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?,
            None => self
                .reserve
                .key(req.stock_key)
                .key(req.user_key)
                .arg(req.quantity)
                .arg(req.per_user_limit)
                .arg(req.user_ttl_secs)
                .arg(req.order_id)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?,
        };
        parse_outcome(&raw)
    }

    async fn release(
        &self,
        stock_key: &str,
        user_key: &str,
        quantity: u32,
        stock_cap: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = self
            .release
            .key(stock_key)
            .key(user_key)
            .arg(quantity)
            .arg(stock_cap)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
