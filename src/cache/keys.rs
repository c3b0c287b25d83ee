//! Hot-store key namespace.
//!
//! Every key the engine touches is built here; nothing formats a
//! `seckill:*` key inline.

pub const PREFIX: &str = "seckill";

pub fn activity(activity_id: &str) -> String {
    format!("{PREFIX}:activity:{activity_id}")
}

pub fn stock(activity_id: &str) -> String {
    format!("{PREFIX}:stock:{activity_id}")
}

pub fn user_limit(user_id: &str, activity_id: &str) -> String {
    format!("{PREFIX}:user_limit:{user_id}:{activity_id}")
}

pub fn rate_limit(key: &str) -> String {
    format!("{PREFIX}:rate_limit:{key}")
}

pub fn metrics(subkey: &str) -> String {
    format!("{PREFIX}:metrics:{subkey}")
}

pub fn idempotency(key: &str) -> String {
    format!("{PREFIX}:idempotency:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(activity("a1"), "seckill:activity:a1");
        assert_eq!(stock("a1"), "seckill:stock:a1");
        assert_eq!(user_limit("u9", "a1"), "seckill:user_limit:u9:a1");
        assert_eq!(rate_limit("global"), "seckill:rate_limit:global");
        assert_eq!(metrics("snapshot"), "seckill:metrics:snapshot");
        assert_eq!(idempotency("abc"), "seckill:idempotency:abc");
    }
}
