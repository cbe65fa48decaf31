//! Per-key token bucket state.

use std::time::{Duration, Instant};

/// Slack allowed when comparing token balances.
///
/// Refill is applied in steps, one per call, and every step rounds. Without
/// slack a caller polling every 100ms at 1 token/s holds 0.9999999999999999
/// tokens at the one-second mark and is refused.
pub(crate) const TOKEN_EPSILON: f64 = 1e-9;

/// Token balance for a single key.
///
/// The bucket itself holds no lock; the limiter wraps each one in a mutex
/// and every method here runs with that mutex held.
#[derive(Debug)]
pub(crate) struct BucketState {
    /// Current token count, `0 <= tokens <= capacity`
    tokens: f64,
    /// When `tokens` was last brought up to date
    last_refill: Instant,
    /// Set once the bucket has been dropped from the registry
    retired: bool,
}

impl BucketState {
    /// Create a bucket that starts full.
    pub(crate) fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            retired: false,
        }
    }

    /// Tokens the bucket would hold at `now`, without storing anything.
    pub(crate) fn available(&self, now: Instant, capacity: f64, refill_rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let tokens = self.tokens + elapsed * refill_rate;
        if tokens >= capacity - TOKEN_EPSILON {
            capacity
        } else {
            tokens
        }
    }

    /// Bring the token count up to date with `now`.
    ///
    /// `last_refill` only moves forward, so a caller that sampled the clock
    /// before a competing caller took the lock cannot rewind it.
    pub(crate) fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64) {
        self.tokens = self.available(now, capacity, refill_rate);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Remove `cost` tokens if the balance covers it, within `TOKEN_EPSILON`.
    pub(crate) fn try_consume(&mut self, cost: f64) -> bool {
        if self.tokens + TOKEN_EPSILON >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `cost` tokens will be available at `refill_rate`.
    ///
    /// Returns `Duration::MAX` when the wait cannot be represented.
    pub(crate) fn time_until(&self, cost: f64, refill_rate: f64) -> Duration {
        let deficit = cost - self.tokens;
        if deficit <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(deficit / refill_rate).unwrap_or(Duration::MAX)
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Whether the bucket has sat untouched for at least `max_idle` and refilled to full.
    pub(crate) fn is_idle(
        &self,
        now: Instant,
        max_idle: Duration,
        capacity: f64,
        refill_rate: f64,
    ) -> bool {
        now.saturating_duration_since(self.last_refill) >= max_idle
            && self.available(now, capacity, refill_rate) >= capacity
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }
}
