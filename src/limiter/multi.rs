//! Multi-tier limiter: one global bucket, lazily allocated per-address and
//! per-user buckets, an idle sweeper, and hot-swappable tier templates.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;

use super::bucket::{BucketSpec, TokenBucket};
use super::Tier;

/// Per-tier bucket templates. Updating a template only affects buckets
/// allocated afterwards; live buckets keep their spec (the global bucket is
/// the one exception, since the tier owns exactly one bucket).
#[derive(Debug, Clone, Copy)]
pub struct TierTemplates {
    pub global: BucketSpec,
    pub address: BucketSpec,
    pub user: BucketSpec,
}

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    Rejected { tier: Tier, retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

pub struct MultiTierLimiter {
    templates: RwLock<TierTemplates>,
    global: Mutex<TokenBucket>,
    address: DashMap<String, Mutex<TokenBucket>>,
    user: DashMap<String, Mutex<TokenBucket>>,
}

impl MultiTierLimiter {
    pub fn new(templates: TierTemplates) -> Self {
        let now = Instant::now();
        Self {
            templates: RwLock::new(templates),
            global: Mutex::new(TokenBucket::new(templates.global, now)),
            address: DashMap::new(),
            user: DashMap::new(),
        }
    }

    /// Full three-tier admission check for a purchase request.
    ///
    /// Phase one peeks each tier in order and reports the first one without
    /// a token; phase two consumes from all three. Each phase takes one
    /// bucket lock at a time.
    pub fn allow(&self, address: &str, user_id: &str) -> Decision {
        let now = Instant::now();

        if let Some(rejected) = self.peek_global(now) {
            return rejected;
        }
        if let Some(rejected) = self.peek_keyed(Tier::Address, address, now) {
            return rejected;
        }
        if let Some(rejected) = self.peek_keyed(Tier::User, user_id, now) {
            return rejected;
        }

        // A competing request may have taken the last token between the two
        // phases; the consume step re-checks and names the losing tier.
        if let Some(rejected) = self.consume_global(now) {
            return rejected;
        }
        if let Some(rejected) = self.consume_keyed(Tier::Address, address, now) {
            return rejected;
        }
        if let Some(rejected) = self.consume_keyed(Tier::User, user_id, now) {
            return rejected;
        }
        Decision::Allowed
    }

    /// Global + address tiers only; guards the public read endpoints where
    /// no user identity is present.
    pub fn allow_address(&self, address: &str) -> Decision {
        let now = Instant::now();
        if let Some(rejected) = self.peek_global(now) {
            return rejected;
        }
        if let Some(rejected) = self.peek_keyed(Tier::Address, address, now) {
            return rejected;
        }
        if let Some(rejected) = self.consume_global(now) {
            return rejected;
        }
        if let Some(rejected) = self.consume_keyed(Tier::Address, address, now) {
            return rejected;
        }
        Decision::Allowed
    }

    /// Hot-swap one tier's template. Existing address/user buckets are left
    /// undisturbed; the global tier's single bucket is reconfigured in place
    /// with its stored tokens clamped to the new capacity.
    pub fn update_tier(&self, tier: Tier, spec: BucketSpec) {
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        match tier {
            Tier::Global => {
                templates.global = spec;
                self.global
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .reconfigure(spec);
            }
            Tier::Address => templates.address = spec,
            Tier::User => templates.user = spec,
        }
        tracing::info!(
            target: "LIMITER",
            tier = tier.as_str(),
            capacity = spec.capacity,
            refill_rate = spec.refill_rate,
            "tier template updated"
        );
    }

    pub fn templates(&self) -> TierTemplates {
        *self.templates.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Evict buckets idle longer than `max_idle`. Returns the eviction count.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for map in [&self.address, &self.user] {
            map.retain(|_, bucket| {
                let keep = now
                    .saturating_duration_since(
                        bucket.lock().unwrap_or_else(|e| e.into_inner()).last_touched(),
                    )
                    < max_idle;
                if !keep {
                    evicted += 1;
                }
                keep
            });
        }
        evicted
    }

    /// Background sweeper loop.
    pub async fn run_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            let evicted = self.sweep(max_idle);
            if evicted > 0 {
                tracing::debug!(target: "LIMITER", evicted, "idle buckets swept");
            }
        }
    }

    pub fn bucket_counts(&self) -> (usize, usize) {
        (self.address.len(), self.user.len())
    }

    fn peek_global(&self, now: Instant) -> Option<Decision> {
        let mut bucket = self.global.lock().unwrap_or_else(|e| e.into_inner());
        if bucket.peek(now) {
            None
        } else {
            Some(Decision::Rejected {
                tier: Tier::Global,
                retry_after_secs: bucket.retry_after_secs(),
            })
        }
    }

    fn consume_global(&self, now: Instant) -> Option<Decision> {
        let mut bucket = self.global.lock().unwrap_or_else(|e| e.into_inner());
        if bucket.try_consume(now) {
            None
        } else {
            Some(Decision::Rejected {
                tier: Tier::Global,
                retry_after_secs: bucket.retry_after_secs(),
            })
        }
    }

    fn peek_keyed(&self, tier: Tier, key: &str, now: Instant) -> Option<Decision> {
        self.with_bucket(tier, key, now, |bucket| {
            if bucket.peek(now) {
                None
            } else {
                Some(Decision::Rejected {
                    tier,
                    retry_after_secs: bucket.retry_after_secs(),
                })
            }
        })
    }

    fn consume_keyed(&self, tier: Tier, key: &str, now: Instant) -> Option<Decision> {
        self.with_bucket(tier, key, now, |bucket| {
            if bucket.try_consume(now) {
                None
            } else {
                Some(Decision::Rejected {
                    tier,
                    retry_after_secs: bucket.retry_after_secs(),
                })
            }
        })
    }

    fn with_bucket<R>(
        &self,
        tier: Tier,
        key: &str,
        now: Instant,
        f: impl FnOnce(&mut TokenBucket) -> R,
    ) -> R {
        let (map, template) = match tier {
            Tier::Address => (&self.address, self.templates().address),
            Tier::User => (&self.user, self.templates().user),
            Tier::Global => unreachable!("global tier has no keyed map"),
        };
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(template, now)));
        let mut bucket = entry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut bucket)
    }
}
