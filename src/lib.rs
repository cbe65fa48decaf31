//! Ratekeeper - In-Process Token Bucket Rate Limiting
//!
//! This crate implements a per-key token bucket limiter for admission control.
//! Each key (user id, API token, client address) gets an independent bucket that
//! refills continuously at a sustained rate up to a burst capacity.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{RateKeeperError, Result};
pub use ratelimit::{Clock, Decision, LimiterSet, ManualClock, MonotonicClock, TokenBucketLimiter};
