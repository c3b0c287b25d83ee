//! Lua sources for the atomic multi-key operations.
//!
//! All stock/user-counter mutation on the hot path goes through these
//! scripts; the store executes each one serially, which is what makes the
//! reservation decision race-free. Keep the outcome shapes in sync with
//! [`super::ReserveOutcome`].

/// Reservation decision without an idempotency record.
///
/// KEYS[1] = stock counter, KEYS[2] = user counter
/// ARGV[1] = quantity, ARGV[2] = per-user limit,
/// ARGV[3] = user-counter TTL seconds (0 = none), ARGV[4] = order id
pub const RESERVE: &str = r#"
local stock = redis.call('GET', KEYS[1])
if not stock then
  return cjson.encode({status='inactive'})
end
stock = tonumber(stock)
local qty = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
if stock < qty then
  return cjson.encode({status='insufficient_stock', remaining_stock=stock})
end
local purchased = tonumber(redis.call('GET', KEYS[2]) or '0')
if purchased + qty > limit then
  return cjson.encode({status='exceeds_user_limit', user_purchased=purchased})
end
local remaining = redis.call('DECRBY', KEYS[1], qty)
local total = redis.call('INCRBY', KEYS[2], qty)
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[2], ttl)
end
return cjson.encode({status='ok', remaining_stock=remaining, user_purchased=total, order_id=ARGV[4]})
"#;

/// Reservation decision with an idempotency record.
///
/// KEYS[3] = idempotency key; a successful decision is recorded under it so
/// a replay returns the identical outcome (same order id) without touching
/// the counters again. Rejections are recomputed on replay.
///
/// ARGV[5] = idempotency record TTL seconds
pub const RESERVE_IDEMPOTENT: &str = r#"
local prior = redis.call('GET', KEYS[3])
if prior then
  return prior
end
local stock = redis.call('GET', KEYS[1])
if not stock then
  return cjson.encode({status='inactive'})
end
stock = tonumber(stock)
local qty = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
if stock < qty then
  return cjson.encode({status='insufficient_stock', remaining_stock=stock})
end
local purchased = tonumber(redis.call('GET', KEYS[2]) or '0')
if purchased + qty > limit then
  return cjson.encode({status='exceeds_user_limit', user_purchased=purchased})
end
local remaining = redis.call('DECRBY', KEYS[1], qty)
local total = redis.call('INCRBY', KEYS[2], qty)
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[2], ttl)
end
local decision = cjson.encode({status='ok', remaining_stock=remaining, user_purchased=total, order_id=ARGV[4]})
redis.call('SET', KEYS[3], decision, 'EX', ARGV[5])
return decision
"#;

/// Compensating action after a failed dispatch.
///
/// KEYS[1] = stock counter, KEYS[2] = user counter
/// ARGV[1] = quantity, ARGV[2] = stock cap (0 = uncapped)
///
/// Restores stock (capped at total_stock) and takes the quantity back from
/// the user counter, floored at zero. KEEPTTL preserves the activity-bounded
/// expiry on both keys.
pub const RELEASE: &str = r#"
local qty = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
local stock = redis.call('INCRBY', KEYS[1], qty)
if cap > 0 and stock > cap then
  redis.call('SET', KEYS[1], cap, 'KEEPTTL')
end
local purchased = tonumber(redis.call('GET', KEYS[2]) or '0')
if purchased > qty then
  redis.call('DECRBY', KEYS[2], qty)
elseif purchased > 0 then
  redis.call('SET', KEYS[2], 0, 'KEEPTTL')
end
return 1
"#;
