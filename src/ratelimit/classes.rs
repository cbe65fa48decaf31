//! Named limiter classes.
//!
//! A `LimiterSet` holds one independent [`TokenBucketLimiter`] per resource
//! class (for example `api`, `login`, `upload`), each with its own capacity
//! and refill rate taken from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::clock::{Clock, MonotonicClock};
use super::limiter::{Decision, TokenBucketLimiter};
use crate::config::RateKeeperConfig;
use crate::error::{RateKeeperError, Result};

/// A set of independent limiters indexed by class name.
pub struct LimiterSet<C: Clock + Clone = MonotonicClock> {
    limiters: BTreeMap<String, Arc<TokenBucketLimiter<C>>>,
}

impl LimiterSet {
    /// Build one limiter per configured class, using the platform monotonic clock.
    pub fn from_config(config: &RateKeeperConfig) -> Result<Self> {
        Self::from_config_with_clock(config, MonotonicClock)
    }
}

impl<C: Clock + Clone> LimiterSet<C> {
    /// Build one limiter per configured class, all sharing readings from `clock`.
    ///
    /// Fails on the first class whose rule is invalid.
    pub fn from_config_with_clock(config: &RateKeeperConfig, clock: C) -> Result<Self> {
        let mut limiters = BTreeMap::new();

        for (class, rule) in &config.limiters {
            let limiter_config = rule.to_limiter_config().map_err(|e| {
                warn!(class = %class, error = %e, "Rejecting limiter class");
                RateKeeperError::InvalidConfig(format!("class '{}': {}", class, e))
            })?;

            info!(
                class = %class,
                capacity = limiter_config.capacity(),
                refill_rate = rule.refill_rate,
                unit = %rule.unit,
                "Limiter class configured"
            );
            limiters.insert(
                class.clone(),
                Arc::new(TokenBucketLimiter::from_config(limiter_config, clock.clone())),
            );
        }

        Ok(Self { limiters })
    }

    /// Get the limiter for a class.
    pub fn get(&self, class: &str) -> Result<&Arc<TokenBucketLimiter<C>>> {
        self.limiters
            .get(class)
            .ok_or_else(|| RateKeeperError::UnknownClass(class.to_string()))
    }

    /// Consume one token for `key` in `class`.
    pub fn allow(&self, class: &str, key: &str) -> Result<bool> {
        Ok(self.get(class)?.allow(key))
    }

    /// Consume one token for `key` in `class`, reporting the remaining quota.
    pub fn check(&self, class: &str, key: &str) -> Result<Decision> {
        Ok(self.get(class)?.check(key))
    }

    /// Tokens available for `key` in `class`.
    pub fn peek(&self, class: &str, key: &str) -> Result<f64> {
        Ok(self.get(class)?.peek(key))
    }

    /// Evict idle buckets from every class. Returns the total removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.limiters
            .values()
            .map(|limiter| limiter.evict_idle(max_idle))
            .sum()
    }

    /// Configured class names, in sorted order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
