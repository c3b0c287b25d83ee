//! Crate-level error taxonomy.
//!
//! Every component returns its own typed error; the gateway converts the
//! outermost error into an HTTP status plus a stable `error_code` string
//! that clients discriminate on. `Internal` is the only catch-all and is
//! always logged with its request id at the recovery boundary.

use thiserror::Error;

use crate::cache::CacheWriteError;
use crate::dispatch::DispatchError;
use crate::limiter::Tier;
use crate::store::StoreError;

/// Unified request-level error.
///
/// The variants mirror the outcome codes surfaced to clients. Payload-carrying
/// variants keep the counters the UI renders (remaining stock, purchased
/// count, retry-after hint).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeckillError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("activity not found: {0}")]
    NotFound(String),

    #[error("activity is not active")]
    NotActive,

    #[error("activity has not started")]
    NotStarted,

    #[error("activity has ended")]
    Ended,

    #[error("out of stock (remaining {remaining})")]
    OutOfStock { remaining: i64 },

    #[error("per-user limit exceeded (purchased {purchased})")]
    UserLimitExceeded { purchased: i64 },

    #[error("rate limited on {tier} tier, retry after {retry_after_secs}s")]
    RateLimited { tier: Tier, retry_after_secs: u64 },

    #[error("server saturated")]
    Saturated,

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("hot store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SeckillError {
    /// Stable error code string carried in the response envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            SeckillError::InvalidParameter(_) => "InvalidParameter",
            SeckillError::Unauthorized => "Unauthorized",
            SeckillError::NotFound(_) => "NotFound",
            SeckillError::NotActive => "NotActive",
            SeckillError::NotStarted => "NotStarted",
            SeckillError::Ended => "Ended",
            SeckillError::OutOfStock { .. } => "OutOfStock",
            SeckillError::UserLimitExceeded { .. } => "UserLimitExceeded",
            SeckillError::RateLimited { .. } => "RateLimited",
            SeckillError::Saturated => "Saturated",
            SeckillError::BrokerUnavailable(_) => "BrokerUnavailable",
            SeckillError::StoreUnavailable(_) => "StoreUnavailable",
            SeckillError::DeadlineExceeded => "DeadlineExceeded",
            SeckillError::Internal(_) => "Internal",
        }
    }

    /// Whether a retry by the server could change the outcome.
    ///
    /// Rate-limit, quota, and stock rejections are final for this request;
    /// only transport-level failures are worth retrying within the deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SeckillError::StoreUnavailable(_) | SeckillError::BrokerUnavailable(_)
        )
    }
}

impl From<StoreError> for SeckillError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SeckillError::StoreUnavailable(msg),
            StoreError::NotFound(key) => SeckillError::NotFound(key),
            StoreError::WrongType(key) => {
                SeckillError::Internal(format!("wrong value type for key {key}"))
            }
            StoreError::DeadlineExceeded => SeckillError::DeadlineExceeded,
        }
    }
}

impl From<CacheWriteError> for SeckillError {
    fn from(err: CacheWriteError) -> Self {
        match err {
            CacheWriteError::Store(err) => err.into(),
            CacheWriteError::Source(err) => {
                SeckillError::StoreUnavailable(format!("system of record: {err}"))
            }
        }
    }
}

impl From<DispatchError> for SeckillError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::BrokerUnavailable(msg) => SeckillError::BrokerUnavailable(msg),
            DispatchError::Rejected(msg) => {
                SeckillError::Internal(format!("broker rejected event: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            SeckillError::OutOfStock { remaining: 0 }.error_code(),
            "OutOfStock"
        );
        assert_eq!(
            SeckillError::UserLimitExceeded { purchased: 2 }.error_code(),
            "UserLimitExceeded"
        );
        assert_eq!(
            SeckillError::BrokerUnavailable("down".into()).error_code(),
            "BrokerUnavailable"
        );
        assert_eq!(SeckillError::NotStarted.error_code(), "NotStarted");
    }

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(SeckillError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(SeckillError::BrokerUnavailable("down".into()).is_retryable());
        assert!(!SeckillError::OutOfStock { remaining: 0 }.is_retryable());
        assert!(!SeckillError::RateLimited {
            tier: Tier::User,
            retry_after_secs: 1
        }
        .is_retryable());
        assert!(!SeckillError::DeadlineExceeded.is_retryable());
    }
}
