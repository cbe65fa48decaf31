//! Token bucket rate limiting and per-key state management.

mod bucket;
mod classes;
mod clock;
mod evictor;
mod limiter;

pub use classes::LimiterSet;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use evictor::{spawn_evictor, IdleEviction};
pub use limiter::{Decision, TokenBucketLimiter};
