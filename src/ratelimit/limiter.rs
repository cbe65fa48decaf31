//! Core token bucket limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::BucketState;
use super::clock::{Clock, MonotonicClock};
use crate::config::LimiterConfig;
use crate::error::Result;

type Bucket = Arc<Mutex<BucketState>>;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Tokens left in the bucket after this decision
    pub remaining: f64,
    /// How long until a request of the same cost would be admitted
    pub retry_after: Duration,
}

impl Decision {
    /// `retry_after` in whole milliseconds, or `None` if the request can never be admitted.
    pub fn retry_after_millis(&self) -> Option<u64> {
        if self.retry_after == Duration::MAX {
            None
        } else {
            Some(u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX))
        }
    }
}

/// A per-key token bucket rate limiter.
///
/// Each key gets its own bucket, created full on first use. Buckets refill
/// continuously at `refill_rate` tokens per second up to `capacity`.
///
/// This struct is thread-safe and can be shared across threads behind an `Arc`.
/// The registry is sharded, and every bucket has its own lock, so callers on
/// different keys do not contend.
pub struct TokenBucketLimiter<C: Clock = MonotonicClock> {
    /// Buckets indexed by caller key
    buckets: DashMap<String, Bucket>,
    config: LimiterConfig,
    clock: C,
}

impl TokenBucketLimiter {
    /// Create a limiter backed by the platform monotonic clock.
    ///
    /// `refill_rate` is in tokens per second. Fails with
    /// [`RateKeeperError::InvalidConfig`](crate::RateKeeperError::InvalidConfig)
    /// unless both values are positive and finite.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        Self::with_clock(capacity, refill_rate, MonotonicClock)
    }
}

impl<C: Clock> TokenBucketLimiter<C> {
    /// Create a limiter reading time from `clock`.
    pub fn with_clock(capacity: f64, refill_rate: f64, clock: C) -> Result<Self> {
        Ok(Self::from_config(LimiterConfig::new(capacity, refill_rate)?, clock))
    }

    /// Create a limiter from an already validated configuration.
    pub fn from_config(config: LimiterConfig, clock: C) -> Self {
        debug!(
            capacity = config.capacity(),
            refill_rate = config.refill_rate(),
            "Creating token bucket limiter"
        );
        Self {
            buckets: DashMap::new(),
            config,
            clock,
        }
    }

    /// Consume one token for `key` if one is available.
    pub fn allow(&self, key: &str) -> bool {
        self.acquire(key, 1.0).allowed
    }

    /// Consume `cost` tokens for `key` if that many are available.
    ///
    /// The bucket is refilled either way. A request costing more than the
    /// capacity is never admitted. A cost that is zero, negative or NaN is
    /// admitted without touching the balance.
    pub fn allow_n(&self, key: &str, cost: f64) -> bool {
        self.acquire(key, cost).allowed
    }

    /// Like [`allow`](Self::allow), but also report the remaining quota.
    pub fn check(&self, key: &str) -> Decision {
        self.acquire(key, 1.0)
    }

    /// Tokens currently available for `key`, without consuming or storing anything.
    ///
    /// A key that has never been seen reports a full bucket.
    pub fn peek(&self, key: &str) -> f64 {
        let Some(bucket) = self.buckets.get(key).map(|b| Arc::clone(b.value())) else {
            return self.config.capacity();
        };

        let state = bucket.lock();
        if state.is_retired() {
            // Only full buckets are retired by eviction
            return self.config.capacity();
        }
        state.available(
            self.clock.now(),
            self.config.capacity(),
            self.config.refill_rate(),
        )
    }

    /// Drop buckets that have been idle for at least `max_idle` and have refilled to full.
    ///
    /// A full bucket is indistinguishable from a freshly created one, so
    /// eviction never changes the outcome of a later call. Returns the number
    /// of buckets removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        let capacity = self.config.capacity();
        let refill_rate = self.config.refill_rate();

        self.buckets.retain(|key, bucket| {
            let mut state = bucket.lock();
            if state.is_idle(self.clock.now(), max_idle, capacity, refill_rate) {
                trace!(key = %key, "Evicting idle bucket");
                state.retire();
                false
            } else {
                true
            }
        });

        before.saturating_sub(self.buckets.len())
    }

    /// Drop every bucket, returning all keys to a full balance.
    pub fn clear(&self) {
        self.buckets.retain(|_, bucket| {
            bucket.lock().retire();
            false
        });
    }

    /// Number of keys with a live bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Burst capacity in tokens.
    pub fn capacity(&self) -> f64 {
        self.config.capacity()
    }

    /// Sustained rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.config.refill_rate()
    }

    /// Refill the bucket for `key` and try to take `cost` tokens from it.
    ///
    /// If the bucket was retired between lookup and locking, the lookup is
    /// repeated so the caller lands on the bucket now in the registry.
    fn acquire(&self, key: &str, cost: f64) -> Decision {
        loop {
            let bucket = self.bucket_for(key);
            let Some(decision) = self.acquire_from(&bucket, cost) else {
                trace!(key = %key, "Bucket retired under us, looking up again");
                continue;
            };

            trace!(
                key = %key,
                cost = cost,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Checked token bucket"
            );
            if !decision.allowed {
                debug!(
                    key = %key,
                    remaining = decision.remaining,
                    retry_after_ms = ?decision.retry_after_millis(),
                    "Rate limit exceeded"
                );
            }
            return decision;
        }
    }

    /// Refill `bucket` and try to take `cost` tokens, all under its lock.
    ///
    /// Returns `None` without touching the balance if the bucket has been retired.
    fn acquire_from(&self, bucket: &Bucket, cost: f64) -> Option<Decision> {
        let capacity = self.config.capacity();
        let refill_rate = self.config.refill_rate();

        let mut state = bucket.lock();
        if state.is_retired() {
            return None;
        }

        state.refill(self.clock.now(), capacity, refill_rate);
        let allowed = if cost > 0.0 {
            state.try_consume(cost)
        } else {
            true
        };
        let retry_after = if allowed {
            Duration::ZERO
        } else if cost > capacity {
            Duration::MAX
        } else {
            state.time_until(cost, refill_rate)
        };

        Some(Decision {
            allowed,
            remaining: state.tokens(),
            retry_after,
        })
    }

    /// Find the bucket for `key`, creating a full one on first use.
    ///
    /// The shard read lock covers the common case. On a miss the entry API
    /// takes the shard write lock and checks again, so concurrent first
    /// touches all end up sharing a single bucket.
    fn bucket_for(&self, key: &str) -> Bucket {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| {
                debug!(
                    key = %key,
                    capacity = self.config.capacity(),
                    "Creating new token bucket"
                );
                Arc::new(Mutex::new(BucketState::full(
                    self.config.capacity(),
                    self.clock.now(),
                )))
            });
        Arc::clone(bucket.value())
    }
}

impl<C: Clock> std::fmt::Debug for TokenBucketLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("capacity", &self.config.capacity())
            .field("refill_rate", &self.config.refill_rate())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
