//! Three-tier token-bucket admission control.
//!
//! Tiers are checked global → address → user; the first tier without a full
//! token rejects the request and names itself in the response. Tokens are
//! consumed only when all three tiers pass. Bucket state is entirely
//! in-process; there is no network call on this path.

mod bucket;
mod multi;

pub use bucket::{BucketSpec, TokenBucket};
pub use multi::{Decision, MultiTierLimiter, TierTemplates};

use serde::Serialize;

/// Rate-limit tier identifier, surfaced verbatim in 429 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Global,
    Address,
    User,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::Address => "address",
            Tier::User => "user",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
